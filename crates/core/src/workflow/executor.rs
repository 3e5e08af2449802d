use super::dag::Dag;
use super::invoker::{FunctionInvoker, InvocationRequest};
use super::node::{ChoiceNode, EndNode, FanInNode, FanOutNode, Node, NodeKind, SimpleNode};
use super::partial_data::{PartialData, PartialDataStore};
use super::progress::{NodeStatus, Progress, ProgressStore};
use crate::composition::FunctionComposition;
use crate::error::{Result, WorkflowError};
use crate::signature::Signature;
use crate::storage::{NoopStateStore, StateStore};
use crate::types::{CompositionExecutionReport, ExecutionReport, NodeId, Params, RequestId};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Effects of one node, applied to the request state only after the node
/// (and every sibling of its wave) succeeded.
struct NodeOutcome {
    node: NodeId,
    kind: NodeKind,
    outputs: Vec<PartialData>,
    skip: Vec<NodeId>,
    first_match: Option<usize>,
    fan_in_deadline: Option<(NodeId, DateTime<Utc>)>,
    report: ExecutionReport,
    result: Option<Params>,
}

impl NodeOutcome {
    fn new(node: &NodeId, kind: NodeKind, report: ExecutionReport) -> Self {
        Self {
            node: node.clone(),
            kind,
            outputs: Vec::new(),
            skip: Vec::new(),
            first_match: None,
            fan_in_deadline: None,
            report,
            result: None,
        }
    }

    fn in_process(node: &NodeId, kind: NodeKind, output: &Params, started: Instant) -> Self {
        let result = Value::Object(output.clone()).to_string();
        let report = ExecutionReport::in_process(result, started.elapsed().as_secs_f64());
        Self::new(node, kind, report)
    }
}

/// Drives requests through a Dag one wave at a time.
///
/// Progress, staged data and per-node reports are process-wide and keyed by
/// request, so one executor serves any number of concurrent requests over
/// shared, immutable Dags.
pub struct WorkflowExecutor {
    progress: ProgressStore,
    partial_data: PartialDataStore,
    invoker: Arc<dyn FunctionInvoker>,
    state_store: Arc<dyn StateStore>,
    reports: Arc<Mutex<HashMap<RequestId, CompositionExecutionReport>>>,
}

impl WorkflowExecutor {
    pub fn new(invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self::with_stores(invoker, ProgressStore::new(), PartialDataStore::new())
    }

    pub fn with_stores(
        invoker: Arc<dyn FunctionInvoker>,
        progress: ProgressStore,
        partial_data: PartialDataStore,
    ) -> Self {
        Self {
            progress,
            partial_data,
            invoker,
            state_store: Arc::new(NoopStateStore),
            reports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mirror progress and staged data into `store` as requests advance.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn partial_data_store(&self) -> &PartialDataStore {
        &self.partial_data
    }

    fn lock_reports(&self) -> MutexGuard<'_, HashMap<RequestId, CompositionExecutionReport>> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a composition from Start to End and return its report. The
    /// request's state is purged whether the run succeeds or not.
    pub async fn invoke(
        &self,
        composition: &FunctionComposition,
        params: Params,
    ) -> Result<CompositionExecutionReport> {
        if let Some(missing) = composition
            .functions
            .iter()
            .find(|function| !self.invoker.knows(function))
        {
            return Err(WorkflowError::FunctionNotFound(missing.clone()));
        }

        let started = Instant::now();
        let dag = &composition.workflow;
        let request_id = self.start_request(dag, params)?;
        tracing::info!(
            "Invoking composition {} (request {})",
            composition.name,
            request_id
        );

        let run = self.run_to_completion(dag, &request_id).await;
        match run {
            Ok(()) => {
                let mut report = self.take_report(&request_id).unwrap_or_default();
                report.response_time = started.elapsed().as_secs_f64();
                self.purge(&request_id);

                tracing::info!(
                    "Composition {} completed in {:.3}s (request {})",
                    composition.name,
                    report.response_time,
                    request_id
                );
                Ok(report)
            }
            Err(err) => {
                match self.progress.get(&request_id) {
                    Ok(progress) => tracing::error!(
                        "Composition {} failed: {}\n{}",
                        composition.name,
                        err,
                        progress
                    ),
                    Err(_) => tracing::error!("Composition {} failed: {}", composition.name, err),
                }
                self.purge(&request_id);
                Err(err)
            }
        }
    }

    async fn run_to_completion(&self, dag: &Dag, request_id: &RequestId) -> Result<()> {
        while self.execute_step(dag, request_id).await? {}
        Ok(())
    }

    /// Instantiate `dag` for a new request and stage `params` as the input of
    /// Start's successor.
    ///
    /// The request stays in memory until [`purge`](Self::purge). Callers
    /// driving it with `execute_step` collect the result with `take_report`
    /// and then purge it.
    pub fn start_request(&self, dag: &Dag, params: Params) -> Result<RequestId> {
        let first = dag.start_next().cloned().ok_or_else(|| {
            WorkflowError::InvalidGraph(format!("start node {} has no successor", dag.start))
        })?;

        let request_id = RequestId::new();
        let progress = self.progress.init(request_id.clone(), dag)?;

        let seeded = self.state_store.save_progress(&progress).and_then(|()| {
            self.stage(PartialData::new(
                request_id.clone(),
                first,
                dag.start.clone(),
                params,
            ))
        });
        if let Err(err) = seeded {
            self.purge(&request_id);
            return Err(err);
        }
        Ok(request_id)
    }

    /// Reload a request from the state store, typically into a fresh executor
    /// after a restart, so `execute_step` carries on after its last committed
    /// wave. Reports of nodes that ran before the reload are not kept.
    pub fn resume(&self, dag: &Dag, request_id: &RequestId) -> Result<Progress> {
        let progress = self
            .state_store
            .load_progress(request_id)?
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.clone()))?;
        for info in &progress.infos {
            dag.get(&info.id)?;
        }

        self.partial_data.purge(request_id);
        let mut restored = 0;
        for info in progress.infos.iter().filter(|info| info.status == NodeStatus::Pending) {
            for data in self.state_store.load_partial_data(request_id, &info.id)? {
                self.partial_data.save(data);
                restored += 1;
            }
        }
        self.progress.save(progress.clone());

        tracing::info!(
            "Resumed request {} with {} staged entries",
            request_id,
            restored
        );
        Ok(progress)
    }

    /// Advance `request_id` by one wave. Returns false once End has run or
    /// nothing is left to do.
    pub async fn execute_step(&self, dag: &Dag, request_id: &RequestId) -> Result<bool> {
        let mut progress = self.progress.get(request_id)?;
        let wave = progress.next_nodes();
        if wave.is_empty() {
            return Ok(false);
        }
        self.execute_wave(dag, &mut progress, &wave).await
    }

    /// Run the nodes of a wave concurrently and commit all of them or none.
    /// While a FanIn is open the wave must finish before its deadline, even
    /// when it holds a single node.
    async fn execute_wave(&self, dag: &Dag, progress: &mut Progress, wave: &[NodeId]) -> Result<bool> {
        tracing::debug!(
            "Dispatching wave of {} nodes (request {}): {:?}",
            wave.len(),
            progress.request_id,
            wave
        );

        let deadline = progress.earliest_open_deadline();
        let results = {
            let snapshot: &Progress = progress;
            let running = join_all(wave.iter().map(|id| self.run_node(dag, snapshot, id)));
            match deadline {
                Some((fan_in, at)) => {
                    let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    match tokio::time::timeout(remaining, running).await {
                        Ok(results) => Ok(results),
                        Err(_) => {
                            tracing::warn!(
                                "Fan-in node {} timed out waiting for its branches (request {})",
                                fan_in,
                                snapshot.request_id
                            );
                            Err(fan_in)
                        }
                    }
                }
                None => Ok(running.await),
            }
        };

        let results = match results {
            Ok(results) => results,
            Err(fan_in) => {
                progress.fail_node(&fan_in)?;
                self.save_progress(progress.clone())?;
                return Err(WorkflowError::FanInTimeout(fan_in));
            }
        };

        let mut outcomes = Vec::with_capacity(wave.len());
        let mut failures = Vec::new();
        for (id, result) in wave.iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => failures.push((id.clone(), err)),
            }
        }

        if !failures.is_empty() {
            for (id, err) in &failures {
                tracing::warn!("Node {} failed (request {}): {}", id, progress.request_id, err);
                progress.fail_node(id)?;
            }
            self.save_progress(progress.clone())?;
            if wave.len() == 1 {
                if let Some((_, err)) = failures.pop() {
                    return Err(err);
                }
            }
            return Err(WorkflowError::ParallelWave(failures));
        }

        let finished = outcomes.iter().any(|outcome| outcome.kind == NodeKind::End);
        for outcome in outcomes {
            self.commit(progress, outcome)?;
        }
        self.save_progress(progress.clone())?;
        Ok(!finished)
    }

    /// Execute one node against the current state without changing it.
    async fn run_node(&self, dag: &Dag, progress: &Progress, id: &NodeId) -> Result<NodeOutcome> {
        let request_id = &progress.request_id;
        match dag.get(id)? {
            Node::Start(_) => Ok(NodeOutcome::in_process(
                id,
                NodeKind::Start,
                &Params::new(),
                Instant::now(),
            )),
            Node::Simple(node) => self.run_simple(dag, request_id, node).await,
            Node::Choice(node) => self.run_choice(dag, progress, node),
            Node::FanOut(node) => self.run_fan_out(dag, request_id, node),
            Node::FanIn(node) => self.run_fan_in(dag, progress, node),
            Node::End(node) => self.run_end(request_id, node),
        }
    }

    async fn run_simple(
        &self,
        dag: &Dag,
        request_id: &RequestId,
        node: &SimpleNode,
    ) -> Result<NodeOutcome> {
        let next = successor_of(&node.id, node.next.as_ref())?;
        let input = self.partial_data.retrieve_single(request_id, &node.id)?;

        if !self.invoker.knows(&node.function) {
            return Err(WorkflowError::FunctionNotFound(node.function.clone()));
        }
        let signature = self.invoker.signature(&node.function);
        if let Some(signature) = &signature {
            signature.check_inputs(&node.function, &input.data)?;
        }

        // Returns only after the function's execution resource is released.
        let invocation = self
            .invoker
            .invoke(InvocationRequest {
                request_id: request_id.clone(),
                node_id: node.id.clone(),
                function: node.function.clone(),
                params: input.data,
                max_response_time: node.max_response_time_ms.map(Duration::from_millis),
            })
            .await?;

        let mut output = invocation.output;
        if let Some(signature) = &signature {
            signature.check_outputs(&node.function, &output)?;
        }
        if let Node::Simple(successor) = dag.get(&next)? {
            if let Some(expected) = self.invoker.signature(&successor.function) {
                Signature::map_output(&mut output, &successor.function, &expected)?;
            }
        }

        let mut outcome = NodeOutcome::new(&node.id, NodeKind::Simple, invocation.report);
        outcome
            .outputs
            .push(PartialData::new(request_id.clone(), next, node.id.clone(), output));
        Ok(outcome)
    }

    fn run_choice(&self, dag: &Dag, progress: &Progress, node: &ChoiceNode) -> Result<NodeOutcome> {
        let started = Instant::now();
        let request_id = &progress.request_id;
        let input = self.partial_data.retrieve_single(request_id, &node.id)?;

        let taken = node.evaluate(&input.data)?;
        let target = node.alternatives.get(taken).cloned().ok_or_else(|| {
            WorkflowError::InvalidGraph(format!("choice {} has no alternative {}", node.id, taken))
        })?;
        let skip: Vec<NodeId> = dag
            .nodes_to_skip(&node.id, taken)?
            .into_iter()
            .filter(|id| matches!(progress.status(id), Ok(NodeStatus::Pending)))
            .collect();
        tracing::debug!(
            "Choice node {} took alternative {}, skipping {} nodes (request {})",
            node.id,
            taken,
            skip.len(),
            request_id
        );

        let mut outcome = NodeOutcome::in_process(&node.id, NodeKind::Choice, &input.data, started);
        outcome.skip = skip;
        outcome.first_match = Some(taken);
        outcome.outputs.push(PartialData::new(
            request_id.clone(),
            target,
            node.id.clone(),
            input.data,
        ));
        Ok(outcome)
    }

    fn run_fan_out(&self, dag: &Dag, request_id: &RequestId, node: &FanOutNode) -> Result<NodeOutcome> {
        let started = Instant::now();
        let input = self.partial_data.retrieve_single(request_id, &node.id)?;

        let parts = node.split(&input.data)?;
        if parts.len() != node.outputs.len() {
            return Err(WorkflowError::InvalidGraph(format!(
                "fan-out node {} has {} successors but produced {} parts",
                node.id,
                node.outputs.len(),
                parts.len()
            )));
        }

        let mut outcome = NodeOutcome::in_process(&node.id, NodeKind::FanOut, &input.data, started);
        outcome.outputs = node
            .outputs
            .iter()
            .zip(parts)
            .map(|(branch, data)| {
                PartialData::new(request_id.clone(), branch.clone(), node.id.clone(), data)
            })
            .collect();

        if let Some(fan_in) = &node.associated_fan_in {
            if let Node::FanIn(fan_in_node) = dag.get(fan_in)? {
                outcome.fan_in_deadline =
                    deadline_after(fan_in_node.timeout_secs).map(|at| (fan_in.clone(), at));
            }
        }
        Ok(outcome)
    }

    fn run_fan_in(&self, dag: &Dag, progress: &Progress, node: &FanInNode) -> Result<NodeOutcome> {
        let started = Instant::now();
        let request_id = &progress.request_id;
        let next = successor_of(&node.id, node.next.as_ref())?;

        if progress
            .fan_in_deadline(&node.id)
            .is_some_and(|deadline| Utc::now() >= deadline)
        {
            return Err(WorkflowError::FanInTimeout(node.id.clone()));
        }

        let mut inputs = self.partial_data.retrieve(request_id, &node.id);
        if inputs.len() < node.degree {
            return Err(WorkflowError::FanInIncomplete {
                node: node.id.clone(),
                received: inputs.len(),
                expected: node.degree,
            });
        }

        let fan_out = dag.fan_out_of(&node.id);
        inputs.sort_by_cached_key(|data| {
            fan_out
                .and_then(|fan_out| dag.branch_index(fan_out, &data.from_node))
                .or_else(|| dag.find(&data.from_node).map(Node::branch))
                .unwrap_or(usize::MAX)
        });
        let merged = node.merge(inputs.into_iter().map(|data| data.data).collect())?;

        let mut outcome = NodeOutcome::in_process(&node.id, NodeKind::FanIn, &merged, started);
        outcome
            .outputs
            .push(PartialData::new(request_id.clone(), next, node.id.clone(), merged));
        Ok(outcome)
    }

    fn run_end(&self, request_id: &RequestId, node: &EndNode) -> Result<NodeOutcome> {
        let started = Instant::now();
        let input = self.partial_data.retrieve_single(request_id, &node.id)?;

        let mut outcome = NodeOutcome::in_process(&node.id, NodeKind::End, &input.data, started);
        outcome.result = Some(input.data);
        Ok(outcome)
    }

    /// Apply a node's effects: stage its outputs, drop its inputs, skip dead
    /// nodes and mark it Executed.
    fn commit(&self, progress: &mut Progress, outcome: NodeOutcome) -> Result<()> {
        let request_id = progress.request_id.clone();

        for data in outcome.outputs {
            self.stage(data)?;
        }
        self.partial_data.consume(&request_id, &outcome.node);
        self.state_store
            .consume_partial_data(&request_id, &outcome.node)?;

        progress.skip_all(&outcome.skip)?;
        if let Some(taken) = outcome.first_match {
            progress.record_choice(outcome.node.clone(), taken);
        }
        if let Some((fan_in, deadline)) = outcome.fan_in_deadline {
            progress.set_fan_in_deadline(fan_in, deadline);
        }
        progress.complete_node(&outcome.node)?;

        let mut reports = self.lock_reports();
        let entry = reports.entry(request_id).or_default();
        entry
            .reports
            .insert(format!("{}_{}", outcome.kind, outcome.node), outcome.report);
        if let Some(result) = outcome.result {
            entry.result = result;
        }
        Ok(())
    }

    fn stage(&self, data: PartialData) -> Result<()> {
        self.state_store.save_partial_data(&data)?;
        self.partial_data.save(data);
        Ok(())
    }

    fn save_progress(&self, progress: Progress) -> Result<()> {
        self.state_store.save_progress(&progress)?;
        self.progress.save(progress);
        Ok(())
    }

    /// Report accumulated so far for `request_id`, removing it.
    pub fn take_report(&self, request_id: &RequestId) -> Option<CompositionExecutionReport> {
        self.lock_reports().remove(request_id)
    }

    /// Drop every trace of a request, in memory and in the state store.
    pub fn purge(&self, request_id: &RequestId) {
        self.progress.delete(request_id);
        let staged = self.partial_data.purge(request_id);
        self.lock_reports().remove(request_id);
        if let Err(err) = self.state_store.purge(request_id) {
            tracing::warn!("Failed to purge stored state of request {}: {}", request_id, err);
        }
        tracing::debug!("Purged request {} ({} staged entries left)", request_id, staged);
    }
}

fn successor_of(node: &NodeId, next: Option<&NodeId>) -> Result<NodeId> {
    next.cloned()
        .ok_or_else(|| WorkflowError::InvalidGraph(format!("node {} has no successor", node)))
}

fn deadline_after(secs: u64) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::try_seconds(i64::try_from(secs).ok()?)?;
    Utc::now().checked_add_signed(delta)
}
