use anyhow::{Context, Result};
use dagrun_core::storage::RedbGraphStore;
use dagrun_core::workflow::{PipelineExecutor, ShellRunner, Validator};
use dagrun_core::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "dagrun.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Shell used to run vertex scripts as `<shell> -c <script>`
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
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
                executor: Default::default(),
                runner: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the graph store path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Store, validator and executor shared by the commands
pub struct AppState {
    pub store: Arc<RedbGraphStore>,
    pub validator: Validator,
    pub executor: PipelineExecutor,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(
            RedbGraphStore::new(config.index_path()).context("Failed to open graph store")?,
        );
        let runner = Arc::new(ShellRunner::new(config.runner.shell.clone()));

        Ok(Self {
            validator: Validator::new(store.clone()),
            executor: PipelineExecutor::new(store.clone(), runner, config.executor.clone()),
            store,
        })
    }
}
