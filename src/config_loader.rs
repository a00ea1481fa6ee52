use config::{Config, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{FrameCodec, Framing};
use crate::voice_registry::RegistrationLayout;

pub const DEFAULT_ENDPOINT_NAME: &str = "VoiceEngineServer";
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_CEILING: usize = 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

/// One `[[backends]]` entry. Kind-specific fields are optional here and
/// checked when the backend is built, so a bad entry only disables that
/// backend instead of the whole service.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub endpoint_name: String,
    #[serde(default)]
    pub socket_path: Option<String>,
    pub framing: Framing,
    pub max_chunk_size: usize,
    pub max_message_size: usize,
    pub concurrent_connections: bool,
    /// Milliseconds a client gets to deliver its request
    pub read_timeout_ms: u64,
    pub store_path: String,
    // Registration layout
    pub token_prefix: String,
    pub adapter_class: String,
    pub adapter_module: String,
    pub voice_module: String,
    pub runtime_path: String,
    // Logging
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    // Ordered: registration order is the order of `list_engines`
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint_name: DEFAULT_ENDPOINT_NAME.to_string(),
            socket_path: None,
            framing: Framing::Plain,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            concurrent_connections: true,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            store_path: default_store_path(),
            token_prefix: "PYTTS".to_string(),
            adapter_class: "VoiceEngineAdapter".to_string(),
            adapter_module: "pysapittsengine.dll".to_string(),
            voice_module: "voices".to_string(),
            runtime_path: default_runtime_path(),
            log_level: "info".to_string(),
            log_file: None,
            backends: Vec::new(),
        }
    }
}

fn default_store_path() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voice-engine-server/registry")
        .to_string_lossy()
        .into_owned()
}

fn default_runtime_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .to_string_lossy()
        .into_owned()
}

impl Settings {
    /// Layer defaults, the optional local and per-user files, an explicit
    /// file (required when given), then `VOICE_ENGINE_*` variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("endpoint_name", defaults.endpoint_name)?
            .set_default("framing", "plain")?
            .set_default("max_chunk_size", DEFAULT_MAX_CHUNK_SIZE as u64)?
            .set_default("max_message_size", DEFAULT_MAX_MESSAGE_SIZE as u64)?
            .set_default("concurrent_connections", true)?
            .set_default("read_timeout_ms", DEFAULT_READ_TIMEOUT_MS)?
            .set_default("store_path", defaults.store_path)?
            .set_default("token_prefix", defaults.token_prefix)?
            .set_default("adapter_class", defaults.adapter_class)?
            .set_default("adapter_module", defaults.adapter_module)?
            .set_default("voice_module", defaults.voice_module)?
            .set_default("runtime_path", defaults.runtime_path)?
            .set_default("log_level", defaults.log_level)?
            .add_source(File::with_name("VoiceEngine").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/voice-engine-server/VoiceEngine",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            );

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // e.g. VOICE_ENGINE_MAX_CHUNK_SIZE=4096
        let builder = builder.add_source(config::Environment::with_prefix("VOICE_ENGINE"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_credential_fallbacks();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_credential_fallbacks(&mut self) {
        for backend in &mut self.backends {
            if backend.kind.eq_ignore_ascii_case("azure") {
                if backend.key.is_none() {
                    backend.key = std::env::var("AZURE_SPEECH_KEY").ok();
                }
                if backend.region.is_none() {
                    backend.region = std::env::var("AZURE_SPEECH_REGION").ok();
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.endpoint_name.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "endpoint_name must not be empty".to_string(),
            ));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_CEILING {
            return Err(config::ConfigError::Message(format!(
                "Invalid max_chunk_size: {}. Must be between 1 and {}",
                self.max_chunk_size, MAX_CHUNK_CEILING
            )));
        }
        if self.max_message_size < self.max_chunk_size {
            return Err(config::ConfigError::Message(
                "max_message_size must be at least max_chunk_size".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(unnamed) = self.backends.iter().position(|b| b.name.trim().is_empty()) {
            return Err(config::ConfigError::Message(format!(
                "backend #{} has an empty name",
                unnamed + 1
            )));
        }
        Ok(())
    }

    /// Where the Unix domain socket lives when no explicit path is set.
    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) => PathBuf::from(path),
            None => dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(format!("{}.sock", self.endpoint_name)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.framing, self.max_chunk_size, self.max_message_size)
    }

    pub fn registration_layout(&self) -> RegistrationLayout {
        RegistrationLayout {
            token_prefix: self.token_prefix.clone(),
            adapter_class: self.adapter_class.clone(),
            adapter_module: self.adapter_module.clone(),
            voice_module: self.voice_module.clone(),
            runtime_path: self.runtime_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_config_load_defaults() {
        let settings = Settings::load(None).expect("Failed to load settings");
        assert!(settings.max_chunk_size > 0);
        assert!(settings.max_message_size >= settings.max_chunk_size);
        assert_eq!(settings.read_timeout(), Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_env_overrides_chunk_size() {
        std::env::set_var("VOICE_ENGINE_MAX_CHUNK_SIZE", "4096");
        let settings = Settings::load(None);
        std::env::remove_var("VOICE_ENGINE_MAX_CHUNK_SIZE");
        assert_eq!(settings.expect("settings").max_chunk_size, 4096);
    }

    #[test]
    #[serial]
    fn test_explicit_file_keeps_backend_order() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
framing = "compressed"

[[backends]]
name = "Piper"
kind = "piper"
models_dir = "/opt/piper"

[[backends]]
name = "Espeak"
kind = "espeak"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).expect("settings");
        assert_eq!(settings.framing, Framing::Compressed);
        let names: Vec<_> = settings.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["Piper", "Espeak"]);
        assert_eq!(settings.backends[0].models_dir.as_deref(), Some("/opt/piper"));
    }

    #[test]
    fn test_validate_rejects_bad_chunk_size() {
        let mut settings = Settings::default();
        settings.max_chunk_size = 0;
        assert!(settings.validate().is_err());
        settings.max_chunk_size = MAX_CHUNK_CEILING + 1;
        assert!(settings.validate().is_err());
        settings.max_chunk_size = MAX_CHUNK_CEILING;
        settings.max_message_size = MAX_CHUNK_CEILING;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_read_timeout() {
        let settings = Settings {
            read_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_explicit_socket_path_wins() {
        let settings = Settings {
            socket_path: Some("/tmp/custom.sock".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.socket_path(), PathBuf::from("/tmp/custom.sock"));
    }
}
