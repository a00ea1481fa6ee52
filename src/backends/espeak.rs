use super::{normalize_locale, run_with_timeout, AudioChunks, ProcessAudio, SpeechBackend, Voice};

use std::io::{Error, ErrorKind, Result};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

pub struct EspeakBackend {
    binary: String,
    vendor: Option<String>,
    voice: Mutex<Option<String>>,
}

impl EspeakBackend {
    pub fn new(binary: Option<String>, vendor: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "espeak-ng".to_string()),
            vendor,
            voice: Mutex::new(None),
        }
    }

    fn default_voice(&self) -> Option<String> {
        self.voice.lock().ok().and_then(|v| v.clone())
    }
}

/// Parse `espeak-ng --voices`:
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  en-us           --/M      English_(America)  gmw/en-US            (en 3)
/// ```
pub fn parse_voice_table(table: &str) -> Vec<Voice> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let gender = match cols[2].rsplit('/').next() {
                Some("M") => Some("Male".to_string()),
                Some("F") => Some("Female".to_string()),
                _ => None,
            };
            Some(Voice {
                id: cols[1].to_string(),
                name: cols[3].replace('_', " "),
                locale: Some(normalize_locale(cols[1])),
                gender,
            })
        })
        .collect()
}

impl SpeechBackend for EspeakBackend {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn vendor(&self) -> Option<&str> {
        Some(self.vendor.as_deref().unwrap_or("eSpeak NG"))
    }

    fn list_voices(&self) -> Result<Vec<Voice>> {
        let mut command = Command::new(&self.binary);
        command.arg("--voices");
        let stdout = run_with_timeout(command, Duration::from_secs(5))?;
        Ok(parse_voice_table(&String::from_utf8_lossy(&stdout)))
    }

    fn set_voice(&self, voice_id: &str) -> Result<()> {
        let mut voice = self
            .voice
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "voice lock poisoned"))?;
        *voice = Some(voice_id.to_string());
        Ok(())
    }

    fn speak_streamed(&self, text: &str, voice: Option<String>) -> Result<AudioChunks> {
        let mut command = Command::new(&self.binary);
        command.arg("--stdout");
        if let Some(voice) = voice.or_else(|| self.default_voice()) {
            command.arg("-v").arg(voice);
        }
        let child = command
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(Box::new(ProcessAudio::spawn("espeak", child)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
Pty Language       Age/Gender VoiceName          File                 Other Languages
 5  af              --/M      Afrikaans          gmw/af
 5  en-us           --/F      English_(America)  gmw/en-US            (en 3)
 5  yue             --/-      Chinese_(Cantonese) sit/yue
";

    #[test]
    fn test_parse_voice_table() {
        let voices = parse_voice_table(TABLE);
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[0].id, "af");
        assert_eq!(voices[0].gender.as_deref(), Some("Male"));
        assert_eq!(voices[1].name, "English (America)");
        assert_eq!(voices[1].locale.as_deref(), Some("en-US"));
        assert_eq!(voices[1].gender.as_deref(), Some("Female"));
        assert_eq!(voices[2].gender, None);
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let backend = EspeakBackend::new(Some("/nonexistent/espeak-ng".to_string()), None);
        assert!(backend.list_voices().is_err());
        assert!(backend.speak_streamed("hello", None).is_err());
    }

    #[test]
    fn test_set_voice_is_remembered() {
        let backend = EspeakBackend::new(None, None);
        backend.set_voice("en-us").unwrap();
        assert_eq!(backend.default_voice().as_deref(), Some("en-us"));
    }

    #[cfg(unix)]
    #[test]
    fn test_requested_voice_overrides_default() {
        // echo stands in for the synthesizer and plays back its arguments
        let backend = EspeakBackend::new(Some("echo".into()), None);
        backend.set_voice("en-us").unwrap();
        let spoken = |voice: Option<String>| {
            let audio: Vec<u8> = backend
                .speak_streamed("hi", voice)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .unwrap()
                .concat();
            String::from_utf8(audio).unwrap()
        };

        assert_eq!(spoken(Some("de".into())), "--stdout -v de hi\n");
        assert_eq!(spoken(None), "--stdout -v en-us hi\n");
    }
}
