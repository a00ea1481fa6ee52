//! Voice registration: persists backend voices into the system speech
//! configuration store so the OS speech subsystem can discover them.
//!
//! Layout (mirrored under the 64-bit and 32-bit views):
//!
//! ```text
//! Engines/<adapter class>        Module, Class, Path
//! Voices/Tokens/<token>          Name, Vendor, Language, Gender, Age, Path, Module, Class
//! ```
//!
//! The shared engine adapter and each voice are registered independently.
//! Both operations are idempotent, and the adapter is checked before every
//! voice registration because a voice cannot be resolved without it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::backends::Voice;
use crate::error::RegistrationError;

pub const VOICE_TOKENS_PATH: &str = "Voices/Tokens";
pub const ENGINES_PATH: &str = "Engines";

pub const PLACEHOLDER_LANGUAGE: &str = "und";
pub const PLACEHOLDER_GENDER: &str = "Neutral";
pub const DEFAULT_AGE: &str = "Adult";

pub type Values = BTreeMap<String, String>;

/// The two views of the system configuration store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreView {
    Bits64,
    Bits32,
}

impl StoreView {
    pub const ALL: [StoreView; 2] = [StoreView::Bits64, StoreView::Bits32];

    fn prefix(self) -> &'static str {
        match self {
            StoreView::Bits64 => "64",
            StoreView::Bits32 => "32",
        }
    }
}

/// A hierarchical key/value store in the shape of the OS registry. Writing
/// a key replaces all of its values at once.
pub trait ConfigStore: Send + Sync {
    fn write_key(&self, view: StoreView, path: &str, values: &Values) -> Result<(), RegistrationError>;

    fn read_key(&self, view: StoreView, path: &str) -> Result<Option<Values>, RegistrationError>;
}

/// Persistent store backed by sled.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self, RegistrationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistrationError::StoreDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    fn key(view: StoreView, path: &str) -> String {
        format!("{}/{}", view.prefix(), path)
    }
}

impl ConfigStore for SledStore {
    fn write_key(&self, view: StoreView, path: &str, values: &Values) -> Result<(), RegistrationError> {
        let serialized = serde_json::to_vec(values).map_err(|source| RegistrationError::Corrupt {
            path: path.to_string(),
            source,
        })?;
        self.db.insert(Self::key(view, path), serialized)?;
        self.db.flush()?;
        Ok(())
    }

    fn read_key(&self, view: StoreView, path: &str) -> Result<Option<Values>, RegistrationError> {
        match self.db.get(Self::key(view, path))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| RegistrationError::Corrupt {
                    path: path.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(StoreView, String), Values>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key and its values, ordered.
    pub fn snapshot(&self) -> BTreeMap<(StoreView, String), Values> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl ConfigStore for MemoryStore {
    fn write_key(&self, view: StoreView, path: &str, values: &Values) -> Result<(), RegistrationError> {
        let mut entries = self.entries.lock().map_err(|_| RegistrationError::Poisoned)?;
        entries.insert((view, path.to_string()), values.clone());
        Ok(())
    }

    fn read_key(&self, view: StoreView, path: &str) -> Result<Option<Values>, RegistrationError> {
        let entries = self.entries.lock().map_err(|_| RegistrationError::Poisoned)?;
        Ok(entries.get(&(view, path.to_string())).cloned())
    }
}

/// Names and paths written into every record, taken from settings.
#[derive(Debug, Clone)]
pub struct RegistrationLayout {
    pub token_prefix: String,
    pub adapter_class: String,
    pub adapter_module: String,
    pub voice_module: String,
    pub runtime_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub token: String,
    pub name: String,
    pub vendor: String,
    pub language: String,
    pub gender: String,
    pub age: String,
    pub path: String,
    pub module: String,
    pub class: String,
}

impl RegistrationRecord {
    pub fn key_path(&self) -> String {
        format!("{}/{}", VOICE_TOKENS_PATH, self.token)
    }

    pub fn to_values(&self) -> Values {
        [
            ("Name", &self.name),
            ("Vendor", &self.vendor),
            ("Language", &self.language),
            ("Gender", &self.gender),
            ("Age", &self.age),
            ("Path", &self.path),
            ("Module", &self.module),
            ("Class", &self.class),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }

    fn from_values(token: String, values: &Values) -> Result<Self, RegistrationError> {
        let path = format!("{}/{}", VOICE_TOKENS_PATH, token);
        let get = |name: &'static str| {
            values
                .get(name)
                .cloned()
                .ok_or_else(|| RegistrationError::MissingAttribute {
                    path: path.clone(),
                    name,
                })
        };
        Ok(Self {
            name: get("Name")?,
            vendor: get("Vendor")?,
            language: get("Language")?,
            gender: get("Gender")?,
            age: get("Age")?,
            path: get("Path")?,
            module: get("Module")?,
            class: get("Class")?,
            token,
        })
    }
}

fn normalize_gender(gender: Option<&str>) -> &'static str {
    match gender.map(str::to_ascii_lowercase).as_deref() {
        Some("male") | Some("m") => "Male",
        Some("female") | Some("f") => "Female",
        _ => PLACEHOLDER_GENDER,
    }
}

pub struct VoiceRegistrar {
    store: Arc<dyn ConfigStore>,
    layout: RegistrationLayout,
    // Serializes adapter checks and multi-view record writes
    lock: Mutex<()>,
}

impl VoiceRegistrar {
    pub fn new(store: Arc<dyn ConfigStore>, layout: RegistrationLayout) -> Self {
        Self {
            store,
            layout,
            lock: Mutex::new(()),
        }
    }

    /// `<prefix>-<backend>-<voice id>`. Whitespace, path separators and
    /// `%` are written as `%XX` so distinct voices never share a token.
    pub fn token_for(&self, backend: &str, voice_id: &str) -> String {
        let raw = format!("{}-{}-{}", self.layout.token_prefix, backend, voice_id);
        let mut token = String::with_capacity(raw.len());
        for c in raw.chars() {
            if c.is_whitespace() || matches!(c, '/' | '\\' | '%') {
                let mut utf8 = [0u8; 4];
                for byte in c.encode_utf8(&mut utf8).bytes() {
                    token.push_str(&format!("%{:02X}", byte));
                }
            } else {
                token.push(c);
            }
        }
        token
    }

    fn adapter_path(&self) -> String {
        format!("{}/{}", ENGINES_PATH, self.layout.adapter_class)
    }

    fn adapter_values(&self) -> Values {
        [
            ("Module", &self.layout.adapter_module),
            ("Class", &self.layout.adapter_class),
            ("Path", &self.layout.runtime_path),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }

    /// Build the record for a voice without persisting it. Missing
    /// attributes get placeholders so the schema is always complete.
    pub fn record_for(&self, backend: &str, vendor: Option<&str>, voice: &Voice) -> RegistrationRecord {
        RegistrationRecord {
            token: self.token_for(backend, &voice.id),
            name: voice.name.clone(),
            vendor: vendor
                .filter(|v| !v.is_empty())
                .unwrap_or(backend)
                .to_string(),
            language: voice
                .locale
                .clone()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_LANGUAGE.to_string()),
            gender: normalize_gender(voice.gender.as_deref()).to_string(),
            age: DEFAULT_AGE.to_string(),
            path: self.layout.runtime_path.clone(),
            module: self.layout.voice_module.clone(),
            class: voice.id.clone(),
        }
    }

    pub fn adapter_registered(&self) -> Result<bool, RegistrationError> {
        let expected = self.adapter_values();
        for view in StoreView::ALL {
            if self.store.read_key(view, &self.adapter_path())?.as_ref() != Some(&expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Register the shared engine adapter if it is not registered yet.
    /// Returns whether anything was written.
    pub fn ensure_adapter(&self) -> Result<bool, RegistrationError> {
        let _guard = self.lock.lock().map_err(|_| RegistrationError::Poisoned)?;
        self.ensure_adapter_locked()
    }

    fn ensure_adapter_locked(&self) -> Result<bool, RegistrationError> {
        if self.adapter_registered()? {
            debug!(adapter = %self.layout.adapter_class, "Engine adapter already registered");
            return Ok(false);
        }
        let values = self.adapter_values();
        for view in StoreView::ALL {
            self.store.write_key(view, &self.adapter_path(), &values)?;
        }
        info!(
            adapter = %self.layout.adapter_class,
            module = %self.layout.adapter_module,
            "Engine adapter registered"
        );
        Ok(true)
    }

    /// Register (or re-register) one voice. Re-registration overwrites the
    /// existing record.
    pub fn register_voice(
        &self,
        backend: &str,
        vendor: Option<&str>,
        voice: &Voice,
    ) -> Result<RegistrationRecord, RegistrationError> {
        let record = self.record_for(backend, vendor, voice);
        let values = record.to_values();

        let _guard = self.lock.lock().map_err(|_| RegistrationError::Poisoned)?;
        self.ensure_adapter_locked()?;
        for view in StoreView::ALL {
            self.store.write_key(view, &record.key_path(), &values)?;
        }

        info!(backend, voice = %voice.id, token = %record.token, "Voice registered");
        Ok(record)
    }

    pub fn lookup(&self, backend: &str, voice_id: &str) -> Result<Option<RegistrationRecord>, RegistrationError> {
        let token = self.token_for(backend, voice_id);
        let path = format!("{}/{}", VOICE_TOKENS_PATH, token);
        match self.store.read_key(StoreView::Bits64, &path)? {
            Some(values) => RegistrationRecord::from_values(token, &values).map(Some),
            None => Ok(None),
        }
    }
}
