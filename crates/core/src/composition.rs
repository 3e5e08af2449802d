use crate::error::{Result, WorkflowError};
use crate::workflow::dag::Dag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A named Dag together with the functions it calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionComposition {
    pub name: String,
    pub workflow: Dag,
    /// Distinct function names referenced by `workflow`, sorted
    pub functions: Vec<String>,
}

impl FunctionComposition {
    pub fn new(name: impl Into<String>, workflow: Dag) -> Self {
        let functions = workflow.unique_functions();
        Self {
            name: name.into(),
            workflow,
            functions,
        }
    }
}

/// Process-wide registry of compositions, keyed by name
#[derive(Clone, Default)]
pub struct CompositionRegistry {
    compositions: Arc<Mutex<HashMap<String, Arc<FunctionComposition>>>>,
}

impl CompositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<FunctionComposition>>> {
        self.compositions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, composition: FunctionComposition) -> Result<Arc<FunctionComposition>> {
        let mut compositions = self.lock();
        if compositions.contains_key(&composition.name) {
            return Err(WorkflowError::CompositionExists(composition.name));
        }

        tracing::info!(
            "Registered composition {} ({} nodes, functions: {:?})",
            composition.name,
            composition.workflow.node_count(),
            composition.functions
        );
        let composition = Arc::new(composition);
        compositions.insert(composition.name.clone(), composition.clone());
        Ok(composition)
    }

    pub fn get(&self, name: &str) -> Result<Arc<FunctionComposition>> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::CompositionNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn remove(&self, name: &str) -> Result<Arc<FunctionComposition>> {
        let removed = self
            .lock()
            .remove(name)
            .ok_or_else(|| WorkflowError::CompositionNotFound(name.to_string()))?;
        tracing::info!("Removed composition {}", name);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builder::sequence_dag;

    #[test]
    fn test_functions_are_unique_and_sorted() {
        let composition =
            FunctionComposition::new("pipeline", sequence_dag(&["square", "inc", "square"]).unwrap());
        assert_eq!(composition.functions, vec!["inc", "square"]);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = CompositionRegistry::new();
        registry
            .register(FunctionComposition::new("b", sequence_dag(&["inc"]).unwrap()))
            .unwrap();
        registry
            .register(FunctionComposition::new("a", sequence_dag(&["inc"]).unwrap()))
            .unwrap();
        assert_eq!(registry.list(), vec!["a", "b"]);

        let duplicate = registry
            .register(FunctionComposition::new("a", sequence_dag(&["dec"]).unwrap()))
            .unwrap_err();
        assert!(matches!(duplicate, WorkflowError::CompositionExists(_)));
        assert_eq!(registry.get("a").unwrap().functions, vec!["inc"]);

        registry.remove("a").unwrap();
        assert!(registry.get("a").unwrap_err().is_not_found());
        assert!(registry.remove("a").is_err());
    }
}
