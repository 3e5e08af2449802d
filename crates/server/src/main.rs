use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use waveflow_core::Params;

mod api;
mod config;
mod invoker;

use config::{AppState, CompositionDocument, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "waveflow", version, about = "Serverless function composition engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "WAVEFLOW_CONFIG", default_value = "waveflow.toml", global = true)]
    config: PathBuf,

    /// Data directory for durable state
    #[arg(short, long, env = "WAVEFLOW_DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Register the compositions of this directory instead of the configured one
    #[arg(long, env = "WAVEFLOW_COMPOSITIONS_DIR", global = true)]
    compositions_dir: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "WAVEFLOW_PORT", default_value_t = 8080, global = true)]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "WAVEFLOW_HOST", default_value = "127.0.0.1", global = true)]
    host: String,

    #[arg(long, value_enum, env = "WAVEFLOW_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Serve the REST API (default)
    Serve,
    /// Run one registered composition and print its report
    Invoke {
        name: String,
        /// Input parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Check composition files without registering them
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("waveflow=info,tower_http=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(&self.config, self.data_dir.clone())?;
        if let Some(dir) = &self.compositions_dir {
            config.compositions.dir = Some(dir.clone());
        }
        Ok(config)
    }
}

/// Parse and validate each file, printing a line per composition.
/// Returns the number of valid files.
fn validate_files(files: &[PathBuf]) -> Result<usize> {
    let mut valid = 0;
    for file in files {
        match validate_file(file) {
            Ok(summary) => {
                println!("{}: {}", file.display(), summary);
                valid += 1;
            }
            Err(err) => println!("{}: invalid: {:#}", file.display(), err),
        }
    }
    Ok(valid)
}

fn validate_file(file: &Path) -> Result<String> {
    let content = std::fs::read_to_string(file).context("Failed to read composition")?;
    let document: CompositionDocument =
        serde_json::from_str(&content).context("Failed to parse composition")?;
    let composition = document.into_composition()?;
    Ok(format!(
        "{} ({} nodes, functions: {})",
        composition.name,
        composition.workflow.node_count(),
        composition.functions.join(", ")
    ))
}

async fn invoke_once(config: &ServerConfig, name: &str, params: &str) -> Result<()> {
    let params: Params =
        serde_json::from_str(params).context("--params must be a JSON object")?;
    let state = AppState::new(config)?;
    let composition = state.registry.get(name)?;

    let report = state.executor.invoke(&composition, params).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!("Starting Waveflow (data directory {})", cli.data_dir.display());
            let config = cli.load_config()?;
            let addr = format!("{}:{}", cli.host, cli.port);
            api::serve(&addr, config).await
        }
        Command::Invoke { name, params } => {
            let config = cli.load_config()?;
            invoke_once(&config, &name, &params).await
        }
        Command::Validate { files } => {
            let valid = validate_files(&files)?;
            if valid < files.len() {
                bail!("{} of {} compositions are invalid", files.len() - valid, files.len());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use waveflow_core::workflow::{sequence_dag, Dag};

    #[test]
    fn test_serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["waveflow", "--port", "9000"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_invoke_with_global_flags() {
        let cli = Cli::try_parse_from([
            "waveflow",
            "invoke",
            "double",
            "--params",
            r#"{"input": 1}"#,
            "--log-format",
            "json",
            "--compositions-dir",
            "flows",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Some(Command::Invoke {
                name: "double".to_string(),
                params: r#"{"input": 1}"#.to_string(),
            })
        );
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.compositions_dir, Some(PathBuf::from("flows")));
    }

    #[test]
    fn test_validate_requires_files() {
        assert!(Cli::try_parse_from(["waveflow", "validate"]).is_err());
    }

    #[test]
    fn test_validate_files_counts_valid_compositions() {
        let temp_dir = TempDir::new().unwrap();
        let good = temp_dir.path().join("good.json");
        let broken = temp_dir.path().join("broken.json");
        let garbage = temp_dir.path().join("garbage.json");

        let document = |name: &str, workflow: Dag| {
            serde_json::to_string(&CompositionDocument {
                name: name.to_string(),
                workflow,
            })
            .unwrap()
        };
        std::fs::write(&good, document("double", sequence_dag(&["inc", "inc"]).unwrap())).unwrap();
        std::fs::write(&broken, document("broken", Dag::new())).unwrap();
        std::fs::write(&garbage, "not json").unwrap();

        assert!(validate_file(&good).unwrap().contains("functions: inc"));
        assert!(validate_file(&broken).is_err());
        assert_eq!(validate_files(&[good, broken, garbage]).unwrap(), 1);
    }

    #[test]
    fn test_compositions_dir_overrides_configuration() {
        let temp_dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "waveflow",
            "--config",
            temp_dir.path().join("missing.toml").to_str().unwrap(),
            "--data-dir",
            temp_dir.path().join("data").to_str().unwrap(),
            "--compositions-dir",
            "flows",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.compositions.dir, Some(PathBuf::from("flows")));
    }
}
