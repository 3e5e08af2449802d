use crate::config::FunctionConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use waveflow_core::workflow::{FunctionInvoker, Invocation, InvocationRequest};
use waveflow_core::{ExecutionReport, Params, Signature, WorkflowError};

#[derive(Serialize)]
struct FunctionRequest<'a> {
    params: &'a Params,
}

#[derive(Deserialize)]
struct FunctionResponse {
    result: Params,
    #[serde(default)]
    is_warm_start: bool,
    #[serde(default)]
    init_time: f64,
}

/// Invokes functions by POSTing their parameters to configured endpoints
pub struct HttpFunctionInvoker {
    client: reqwest::Client,
    functions: HashMap<String, FunctionConfig>,
}

impl HttpFunctionInvoker {
    pub fn new(functions: &HashMap<String, FunctionConfig>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        tracing::info!("Configured {} function endpoints", functions.len());
        Ok(Self {
            client,
            functions: functions.clone(),
        })
    }
}

fn invocation_error(function: &str, err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Invocation {
        function: function.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(&self, request: InvocationRequest) -> waveflow_core::Result<Invocation> {
        let function = self
            .functions
            .get(&request.function)
            .ok_or_else(|| WorkflowError::FunctionNotFound(request.function.clone()))?;
        let timeout = request
            .max_response_time
            .unwrap_or(Duration::from_secs(function.timeout_secs));

        tracing::debug!(
            "Invoking {} at {} for node {} (request {})",
            request.function,
            function.url,
            request.node_id,
            request.request_id
        );

        let started = Instant::now();
        let response = self
            .client
            .post(&function.url)
            .timeout(timeout)
            .json(&FunctionRequest {
                params: &request.params,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| invocation_error(&request.function, e))?;
        let body: FunctionResponse = response
            .json()
            .await
            .map_err(|e| invocation_error(&request.function, e))?;
        let response_time = started.elapsed().as_secs_f64();

        let report = ExecutionReport {
            result: Value::Object(body.result.clone()).to_string(),
            response_time,
            is_warm_start: body.is_warm_start,
            init_time: body.init_time,
            duration: (response_time - body.init_time).max(0.0),
        };
        Ok(Invocation {
            output: body.result,
            report,
        })
    }

    fn signature(&self, function: &str) -> Option<Signature> {
        self.functions.get(function).and_then(FunctionConfig::signature)
    }

    fn knows(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use waveflow_core::{NodeId, RequestId};

    fn function(url: String) -> FunctionConfig {
        FunctionConfig {
            url,
            timeout_secs: 5,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn request(function: &str, params: Value) -> InvocationRequest {
        InvocationRequest {
            request_id: RequestId::new(),
            node_id: NodeId::new("node"),
            function: function.to_string(),
            params: params.as_object().cloned().unwrap(),
            max_response_time: None,
        }
    }

    async fn spawn_function_server() -> String {
        let app = Router::new().route(
            "/inc",
            post(|Json(body): Json<Value>| async move {
                let n = body["params"]["input"].as_i64().unwrap_or_default();
                Json(json!({ "result": { "result": n + 1 }, "is_warm_start": true }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_invoke_posts_params_and_reads_result() {
        let base = spawn_function_server().await;
        let functions = HashMap::from([("inc".to_string(), function(format!("{}/inc", base)))]);
        let invoker = HttpFunctionInvoker::new(&functions).unwrap();

        let invocation = invoker.invoke(request("inc", json!({"input": 41}))).await.unwrap();
        assert_eq!(invocation.output, json!({"result": 42}).as_object().cloned().unwrap());
        assert!(invocation.report.is_warm_start);
        assert!(invocation.report.response_time >= invocation.report.duration);
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_found() {
        let invoker = HttpFunctionInvoker::new(&HashMap::new()).unwrap();
        assert!(!invoker.knows("missing"));

        let err = invoker.invoke(request("missing", json!({}))).await.unwrap_err();
        assert!(matches!(err, WorkflowError::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let functions = HashMap::from([(
            "down".to_string(),
            function("http://127.0.0.1:1/down".to_string()),
        )]);
        let invoker = HttpFunctionInvoker::new(&functions).unwrap();

        let err = invoker.invoke(request("down", json!({}))).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
