use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{self, SpeechBackend};
use crate::config_loader::BackendConfig;
use crate::error::{BackendInitError, DispatchError};

/// The backends that survived startup probing, in configuration order.
/// Read-only once built.
pub struct BackendRegistry {
    backends: Vec<(String, Arc<dyn SpeechBackend>)>,
}

impl BackendRegistry {
    /// Build and probe every configured backend. Blocking: backends may
    /// call out to the network while listing voices.
    pub fn initialize(configs: &[BackendConfig]) -> Self {
        Self::probe(
            configs
                .iter()
                .map(|config| (config.name.clone(), backends::build(config))),
        )
    }

    /// Keep each candidate whose `list_voices` probe succeeds. Failures are
    /// logged and skipped; an empty voice list still counts as available.
    pub fn probe<I>(candidates: I) -> Self
    where
        I: IntoIterator<Item = (String, Result<Arc<dyn SpeechBackend>, BackendInitError>)>,
    {
        let mut backends: Vec<(String, Arc<dyn SpeechBackend>)> = Vec::new();

        for (name, built) in candidates {
            if backends.iter().any(|(existing, _)| *existing == name) {
                warn!(backend = %name, "Duplicate backend name in settings, keeping the first");
                continue;
            }

            let backend = match built {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Error initializing backend: {}", e);
                    continue;
                }
            };

            match backend.list_voices() {
                Ok(voices) => {
                    info!(
                        backend = %name,
                        kind = backend.id(),
                        voices = voices.len(),
                        "Backend initialized"
                    );
                    backends.push((name, backend));
                }
                Err(source) => {
                    let e = BackendInitError::Probe {
                        backend: name,
                        source,
                    };
                    warn!("Error initializing backend: {}", e);
                }
            }
        }

        if backends.is_empty() {
            warn!("No speech backends available; list_engines will be empty");
        }

        Self { backends }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn SpeechBackend>, DispatchError> {
        self.backends
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, backend)| backend.clone())
            .ok_or_else(|| DispatchError::EngineNotFound(name.to_string()))
    }

    pub fn available_names(&self) -> Vec<String> {
        self.backends.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
