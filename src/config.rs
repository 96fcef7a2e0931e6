//! # Configuration Management
//!
//! Settings are layered from several sources:
//! - Default values (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix, nested with `__`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_WORKER__CANCEL_GRACE_MS`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::transcription::catalog::BUILTIN_VARIANTS;

/// Main application configuration.
///
/// Each section maps to one table in `config.toml`:
///
/// ```toml
/// [server]
/// host = "0.0.0.0"
/// port = 8080
///
/// [models]
/// directory = "models"
/// default_variant = "tiny"
/// device = "auto"
///
/// [storage]
/// recordings_dir = "recordings"
///
/// [worker]
/// update_channel_capacity = 256
/// cancel_grace_ms = 5000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where model variants live and how they are run.
///
/// Every variant is a directory `<directory>/<variant id>` holding
/// `config.json`, `tokenizer.json` and `model.safetensors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub directory: PathBuf,
    /// Variant used when a requested one is not on disk. Must be shipped with the install.
    pub default_variant: String,
    /// Compute device preference: "auto", "cpu", "cuda" or "metal"
    pub device: String,
}

/// Location of the audio recordings that tasks refer to by file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub recordings_dir: PathBuf,
}

/// Tuning for the scheduler and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Buffered updates per broadcast channel before slow subscribers start lagging
    pub update_channel_capacity: usize,
    /// How long a canceled run may stay silent before it is reported `canceled`
    pub cancel_grace_ms: u64,
}

impl WorkerConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                directory: PathBuf::from("models"),
                default_variant: "tiny".to_string(), // Smallest variant, bundled with installs
                device: "auto".to_string(),
            },
            storage: StorageConfig {
                recordings_dir: PathBuf::from("recordings"),
            },
            worker: WorkerConfig {
                update_channel_capacity: 256,
                cancel_grace_ms: 5_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS__DEFAULT_VARIANT=base`: Override the fallback variant
    /// - `APP_STORAGE__RECORDINGS_DIR=/data/recordings`: Override the recordings location
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // `__` keeps single underscores available inside key names
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.directory.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Models directory must be set"));
        }

        if !BUILTIN_VARIANTS
            .iter()
            .any(|variant| variant.id == self.models.default_variant)
        {
            return Err(anyhow::anyhow!(
                "Unknown default model variant '{}'",
                self.models.default_variant
            ));
        }

        if self.storage.recordings_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Recordings directory must be set"));
        }

        if self.worker.update_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Update channel capacity must be greater than 0"));
        }

        if self.worker.cancel_grace_ms == 0 {
            return Err(anyhow::anyhow!("Cancel grace period must be greater than 0"));
        }

        Ok(())
    }
}
