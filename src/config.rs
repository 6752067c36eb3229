//! Service configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! environment variables and command-line flags (see [`crate::cli::Cli`]).

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use fence::{sqlite::DEFAULT_TABLE, ConditionalStore, InMemoryStore, SqliteStore};
use serde::{Deserialize, Serialize};

use crate::cli::{BackendKind, Cli};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:12345";
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub lease_duration_secs: u64,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    Memory,
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_table")]
        table: String,
    },
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 12345)),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            backend: BackendConfig::Memory,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve the effective configuration for a command line.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(bind) = cli.bind {
            self.bind_addr = bind;
        }
        if let Some(secs) = cli.lease_duration_secs {
            self.lease_duration_secs = secs;
        }

        let current_table = match &self.backend {
            BackendConfig::Sqlite { table, .. } => table.clone(),
            BackendConfig::Memory => default_table(),
        };
        let table = cli.table.clone().unwrap_or(current_table);

        self.backend = match (cli.backend, &cli.database, &self.backend) {
            (Some(BackendKind::Memory), Some(_), _) => {
                bail!("--database cannot be combined with the memory backend")
            }
            (Some(BackendKind::Memory), None, _) => BackendConfig::Memory,
            (_, Some(path), _) => BackendConfig::Sqlite {
                path: path.clone(),
                table,
            },
            (_, None, BackendConfig::Sqlite { path, .. }) => BackendConfig::Sqlite {
                path: path.clone(),
                table,
            },
            (Some(BackendKind::Sqlite), None, BackendConfig::Memory) => {
                bail!("the sqlite backend needs a database path (--database or FENCELOCK_DATABASE)")
            }
            (None, None, BackendConfig::Memory) => BackendConfig::Memory,
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_secs == 0 {
            bail!("lease_duration_secs must be positive");
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }
}

impl BackendConfig {
    /// Open the configured store and provision its schema.
    pub async fn open(&self) -> Result<Arc<dyn ConditionalStore>> {
        let store: Arc<dyn ConditionalStore> = match self {
            BackendConfig::Memory => Arc::new(InMemoryStore::new()),
            BackendConfig::Sqlite { path, table } => Arc::new(
                SqliteStore::open(path, table)
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            ),
        };
        store
            .ensure_schema()
            .await
            .context("failed to provision lease storage")?;
        Ok(store)
    }
}
