use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strand_llm::{DEFAULT_ACK_TIMEOUT, DEFAULT_MODEL, StreamConfig, StreamMessages};

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/stream";
pub const SETTINGS_DIRECTORY_NAME: &str = "strand";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "conversations.db";
pub const ENV_PREFIX: &str = "STRAND_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandSettings {
    /// WebSocket URL of the streaming endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_retrieving_knowledge_text")]
    pub retrieving_knowledge_text: String,
    #[serde(default = "default_invalid_response_text")]
    pub invalid_response_text: String,
    #[serde(default = "default_prediction_failed_text")]
    pub prediction_failed_text: String,
}

impl Default for StrandSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: String::new(),
            database_path: default_database_path(),
            default_model: default_model(),
            ack_timeout_ms: default_ack_timeout_ms(),
            retrieving_knowledge_text: default_retrieving_knowledge_text(),
            invalid_response_text: default_invalid_response_text(),
            prediction_failed_text: default_prediction_failed_text(),
        }
    }
}

impl StrandSettings {
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            endpoint: non_blank(self.endpoint, defaults.endpoint),
            token: self.token.trim().to_string(),
            database_path: non_blank(self.database_path, defaults.database_path),
            default_model: non_blank(self.default_model, defaults.default_model),
            ack_timeout_ms: if self.ack_timeout_ms == 0 {
                defaults.ack_timeout_ms
            } else {
                self.ack_timeout_ms
            },
            retrieving_knowledge_text: non_blank(
                self.retrieving_knowledge_text,
                defaults.retrieving_knowledge_text,
            ),
            invalid_response_text: non_blank(
                self.invalid_response_text,
                defaults.invalid_response_text,
            ),
            prediction_failed_text: non_blank(
                self.prediction_failed_text,
                defaults.prediction_failed_text,
            ),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stream_messages(&self) -> StreamMessages {
        StreamMessages {
            retrieving_knowledge: self.retrieving_knowledge_text.clone(),
            invalid_response: self.invalid_response_text.clone(),
            prediction_failed: self.prediction_failed_text.clone(),
            ..StreamMessages::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.token.clone())
            .with_ack_timeout(self.ack_timeout())
            .with_messages(self.stream_messages())
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<StrandSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".strand"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<StrandSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: StrandSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `STRAND_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(StrandSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn load_from_disk(path: &Path) -> StrandSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found; using defaults and environment");
        }

        match Self::figment(path).extract::<StrandSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings; using defaults"
                );
                StrandSettings::default()
            }
        }
    }

    fn persist(&self, settings: &StrandSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_database_path() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_ack_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_ACK_TIMEOUT.as_millis()).unwrap_or(30_000)
}

fn default_retrieving_knowledge_text() -> String {
    StreamMessages::default().retrieving_knowledge
}

fn default_invalid_response_text() -> String {
    StreamMessages::default().invalid_response
}

fn default_prediction_failed_text() -> String {
    StreamMessages::default().prediction_failed
}
