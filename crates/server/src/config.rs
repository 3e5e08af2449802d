use crate::invoker::HttpFunctionInvoker;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use waveflow_core::storage::RedbStateStore;
use waveflow_core::workflow::{Dag, FunctionInvoker, WorkflowExecutor};
use waveflow_core::{CompositionRegistry, FunctionComposition, ParamDef, Signature};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP endpoints backing function names
    #[serde(default)]
    pub functions: HashMap<String, FunctionConfig>,

    #[serde(default)]
    pub compositions: CompositionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Mirror request state into the state file
    #[serde(default)]
    pub durable: bool,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            durable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub inputs: Vec<ParamDef>,

    #[serde(default)]
    pub outputs: Vec<ParamDef>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl FunctionConfig {
    /// Declared signature, if any parameter is declared.
    pub fn signature(&self) -> Option<Signature> {
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return None;
        }
        Some(Signature {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositionsConfig {
    /// Directory of `*.json` compositions registered at start-up
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                functions: HashMap::new(),
                compositions: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the state store path
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }
}

/// A composition as stored on disk or posted to the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionDocument {
    pub name: String,
    pub workflow: Dag,
}

impl CompositionDocument {
    /// Validate the Dag and wrap it into a composition.
    pub fn into_composition(self) -> waveflow_core::Result<FunctionComposition> {
        self.workflow.validate()?;
        Ok(FunctionComposition::new(self.name, self.workflow))
    }
}

/// Register every `*.json` composition found under `dir`.
pub fn load_compositions(dir: &Path, registry: &CompositionRegistry) -> Result<usize> {
    let mut loaded = 0;
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.context("Failed to read compositions directory")?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("json")
        {
            continue;
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read composition {}", path.display()))?;
        let document: CompositionDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse composition {}", path.display()))?;
        let composition = document
            .into_composition()
            .with_context(|| format!("Invalid composition {}", path.display()))?;
        registry
            .register(composition)
            .with_context(|| format!("Failed to register composition {}", path.display()))?;
        loaded += 1;
    }

    tracing::info!("Loaded {} compositions from {}", loaded, dir.display());
    Ok(loaded)
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: CompositionRegistry,
    pub executor: Arc<WorkflowExecutor>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let invoker = HttpFunctionInvoker::new(&config.functions)
            .context("Failed to create function invoker")?;

        let mut executor = WorkflowExecutor::new(Arc::new(invoker));
        if config.storage.durable {
            let state_store = RedbStateStore::new(config.state_path())
                .context("Failed to create state store")?;
            executor = executor.with_state_store(Arc::new(state_store));
        }

        let registry = CompositionRegistry::new();
        if let Some(dir) = &config.compositions.dir {
            load_compositions(dir, &registry)?;
        }

        Ok(Self {
            registry,
            executor: Arc::new(executor),
        })
    }

    /// State backed by an arbitrary invoker and an empty registry.
    pub fn with_invoker(invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            registry: CompositionRegistry::new(),
            executor: Arc::new(WorkflowExecutor::new(invoker)),
        }
    }
}
