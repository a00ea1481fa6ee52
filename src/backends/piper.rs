use super::{normalize_locale, AudioChunks, ProcessAudio, SpeechBackend, Voice};
use serde_json::Value;
use std::io::{Error, ErrorKind, Result, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

pub struct PiperBackend {
    binary_path: String,
    models_dir: PathBuf,
    vendor: Option<String>,
    voice: Mutex<Option<String>>,
}

impl PiperBackend {
    pub fn new(binary: Option<String>, models_dir: Option<String>, vendor: Option<String>) -> Self {
        let models_dir = models_dir.map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share/piper/models")
        });

        Self {
            binary_path: binary.unwrap_or_else(|| "piper".to_string()),
            models_dir,
            vendor,
            voice: Mutex::new(None),
        }
    }

    fn find_model(&self, voice_id: &str) -> Option<PathBuf> {
        let onnx = self.models_dir.join(format!("{}.onnx", voice_id));
        onnx.exists().then_some(onnx)
    }

    fn parse_voice_metadata(config_path: &Path, voice_id: &str) -> Voice {
        let mut voice = Voice {
            id: voice_id.to_string(),
            name: voice_id.replace('_', " "),
            locale: None,
            gender: None,
        };

        let Ok(content) = std::fs::read_to_string(config_path) else {
            return voice;
        };
        let Ok(json) = serde_json::from_str::<Value>(&content) else {
            return voice;
        };

        if let Some(quality) = json
            .get("audio")
            .and_then(|a| a.get("quality"))
            .and_then(|q| q.as_str())
        {
            voice.name = format!("{} ({})", voice_id.replace('_', " "), quality);
        }

        // Newer models carry language.code, older ones only espeak.voice
        voice.locale = json
            .get("language")
            .and_then(|l| l.get("code"))
            .and_then(|c| c.as_str())
            .or_else(|| {
                json.get("espeak")
                    .and_then(|e| e.get("voice"))
                    .and_then(|v| v.as_str())
            })
            .map(normalize_locale);

        voice
    }
}

impl SpeechBackend for PiperBackend {
    fn id(&self) -> &'static str {
        "piper"
    }

    fn vendor(&self) -> Option<&str> {
        Some(self.vendor.as_deref().unwrap_or("Piper"))
    }

    fn list_voices(&self) -> Result<Vec<Voice>> {
        let entries = std::fs::read_dir(&self.models_dir).map_err(|e| {
            Error::new(
                e.kind(),
                format!("Cannot read models dir {}: {}", self.models_dir.display(), e),
            )
        })?;

        let mut voices = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("onnx") {
                continue;
            }
            if let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) {
                voices.push(Self::parse_voice_metadata(
                    &path.with_extension("onnx.json"),
                    file_stem,
                ));
            }
        }

        voices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(voices)
    }

    fn set_voice(&self, voice_id: &str) -> Result<()> {
        if self.find_model(voice_id).is_none() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("Piper model not found locally for voice: {}", voice_id),
            ));
        }
        let mut voice = self
            .voice
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "voice lock poisoned"))?;
        *voice = Some(voice_id.to_string());
        Ok(())
    }

    fn speak_streamed(&self, text: &str, voice: Option<String>) -> Result<AudioChunks> {
        let selected = voice.or_else(|| self.voice.lock().ok().and_then(|v| v.clone()));
        let voice_id = match selected {
            Some(voice) => voice,
            None => self
                .list_voices()?
                .into_iter()
                .next()
                .map(|v| v.id)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, "No Piper models installed"))?,
        };

        let onnx_path = self.find_model(&voice_id).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("Piper model not found locally for voice: {}", voice_id),
            )
        })?;

        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&onnx_path)
            .arg("--output_file")
            .arg("-") // Output WAV to stdout
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Write text to stdin and close it
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
            stdin.write_all(b"\n")?;
        }

        Ok(Box::new(ProcessAudio::spawn("piper", child)?))
    }
}
