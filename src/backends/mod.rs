pub mod azure;
pub mod espeak;
pub mod piper;

use std::io::{Error, ErrorKind, Read, Result};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config_loader::BackendConfig;
use crate::error::BackendInitError;

/// Size of the pieces backends hand out while streaming audio.
pub const AUDIO_CHUNK_SIZE: usize = 16 * 1024;

/// Represents a text-to-speech voice
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub locale: Option<String>,
    pub gender: Option<String>,
}

/// Lazily produced audio. Each item is one piece of the synthesized stream.
pub type AudioChunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Trait that all speech synthesis backends must implement.
/// Calls are blocking and may wait on a remote provider.
pub trait SpeechBackend: Send + Sync {
    /// Returns the kind of backend (e.g., "espeak-ng")
    fn id(&self) -> &'static str;

    /// Vendor name recorded when a voice is registered
    fn vendor(&self) -> Option<&str> {
        None
    }

    /// Returns a list of supported voices
    fn list_voices(&self) -> Result<Vec<Voice>>;

    /// Makes `voice_id` the default for requests that name no voice
    fn set_voice(&self, voice_id: &str) -> Result<()>;

    /// Synthesizes `text` with `voice`, or the default voice when `None`.
    /// The voice applies to this call only.
    fn speak_streamed(&self, text: &str, voice: Option<String>) -> Result<AudioChunks>;
}

/// Build the backend described by one settings entry. Probing happens in
/// the registry, not here.
pub fn build(config: &BackendConfig) -> std::result::Result<Arc<dyn SpeechBackend>, BackendInitError> {
    let missing = |setting: &'static str| BackendInitError::MissingSetting {
        backend: config.name.clone(),
        setting,
    };

    match config.kind.to_ascii_lowercase().as_str() {
        "espeak" | "espeak-ng" => Ok(Arc::new(espeak::EspeakBackend::new(
            config.binary.clone(),
            config.vendor.clone(),
        ))),
        "piper" => Ok(Arc::new(piper::PiperBackend::new(
            config.binary.clone(),
            config.models_dir.clone(),
            config.vendor.clone(),
        ))),
        "azure" | "microsoft" => {
            let key = config.key.clone().ok_or_else(|| missing("key"))?;
            let base_url = match (&config.endpoint, &config.region) {
                (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
                (None, Some(region)) => format!("https://{}.tts.speech.microsoft.com", region),
                (None, None) => return Err(missing("region")),
            };
            Ok(Arc::new(azure::AzureBackend::new(
                key,
                base_url,
                config.vendor.clone(),
            )))
        }
        other => Err(BackendInitError::UnknownKind {
            backend: config.name.clone(),
            kind: other.to_string(),
        }),
    }
}

/// Streams any reader in `AUDIO_CHUNK_SIZE` pieces.
pub struct ReadChunks<R> {
    reader: R,
    done: bool,
}

impl<R: Read> ReadChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ReadChunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; AUDIO_CHUNK_SIZE];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Most stderr kept for an error message. Anything past it is read and dropped.
const STDERR_LIMIT: usize = 8 * 1024;

/// Audio read from a synthesizer process's stdout. Stderr is drained on a
/// helper thread so a chatty process cannot block on a full pipe. The exit
/// status is checked once stdout is exhausted; the child is killed if the
/// stream is dropped early.
pub struct ProcessAudio {
    label: &'static str,
    child: Child,
    stdout: ReadChunks<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

fn drain_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

impl ProcessAudio {
    pub fn spawn(label: &'static str, mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Other, format!("{}: stdout not captured", label)))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| std::thread::spawn(move || drain_stderr(stderr)));
        Ok(Self {
            label,
            child,
            stdout: ReadChunks::new(stdout),
            stderr,
            finished: false,
        })
    }

    fn exit_error(&mut self) -> Option<Error> {
        self.finished = true;
        let status = match self.child.wait() {
            Ok(status) => status,
            Err(e) => return Some(e),
        };
        let err_msg = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            return None;
        }
        Some(Error::new(
            ErrorKind::Other,
            format!("{} error: {}", self.label, err_msg.trim()),
        ))
    }
}

impl Iterator for ProcessAudio {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.stdout.next() {
            Some(chunk) => Some(chunk),
            None => self.exit_error().map(Err),
        }
    }
}

impl Drop for ProcessAudio {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Run a short-lived command and return its stdout, killing it after `timeout`.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Vec<u8>> {
    use wait_timeout::ChildExt;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let output = child.wait_with_output()?;
            if status.success() {
                Ok(output.stdout)
            } else {
                let err_msg = String::from_utf8_lossy(&output.stderr);
                Err(Error::new(ErrorKind::Other, format!("command failed: {}", err_msg.trim())))
            }
        }
        None => {
            // Timeout occurred, kill the process
            let _ = child.kill();
            let _ = child.wait();
            Err(Error::new(
                ErrorKind::TimedOut,
                format!("command timed out after {:?}", timeout),
            ))
        }
    }
}

/// "en_US" and "en-us" both become "en-US".
pub fn normalize_locale(raw: &str) -> String {
    let mut parts = raw.split(['_', '-']);
    let lang = parts.next().unwrap_or_default().to_ascii_lowercase();
    match parts.next() {
        Some(region) if region.len() == 2 => format!("{}-{}", lang, region.to_ascii_uppercase()),
        Some(rest) => format!("{}-{}", lang, rest),
        None => lang,
    }
}
