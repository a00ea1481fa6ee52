//! Microsoft Azure neural text-to-speech over its REST API.

use super::{AudioChunks, ReadChunks, SpeechBackend, Voice};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::io::{Error, ErrorKind, Result};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_VOICE: &str = "en-US-JennyNeural";
const OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureVoice {
    short_name: String,
    display_name: Option<String>,
    locale: Option<String>,
    gender: Option<String>,
}

pub struct AzureBackend {
    key: String,
    base_url: String,
    vendor: Option<String>,
    voice: Mutex<Option<String>>,
}

fn http_error(e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        ErrorKind::TimedOut
    } else {
        ErrorKind::Other
    };
    Error::new(kind, format!("Azure request failed: {}", e))
}

/// Escape text for inclusion in SSML.
fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// "en-US-JennyNeural" speaks "en-US".
fn voice_locale(voice_id: &str) -> &str {
    match voice_id.match_indices('-').nth(1) {
        Some((idx, _)) => &voice_id[..idx],
        None => "en-US",
    }
}

pub fn build_ssml(voice_id: &str, text: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{lang}'><voice xml:lang='{lang}' name='{voice}'>{text}</voice></speak>",
        lang = voice_locale(voice_id),
        voice = escape_xml(voice_id),
        text = escape_xml(text),
    )
}

impl AzureBackend {
    pub fn new(key: String, base_url: String, vendor: Option<String>) -> Self {
        Self {
            key,
            base_url,
            vendor,
            voice: Mutex::new(None),
        }
    }

    // A blocking client owns a runtime and must not be dropped on an async
    // worker, so one is built per call on the blocking thread.
    fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("voice-engine-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(http_error)
    }
}

impl SpeechBackend for AzureBackend {
    fn id(&self) -> &'static str {
        "azure"
    }

    fn vendor(&self) -> Option<&str> {
        Some(self.vendor.as_deref().unwrap_or("Microsoft"))
    }

    fn list_voices(&self) -> Result<Vec<Voice>> {
        let url = format!("{}/cognitiveservices/voices/list", self.base_url);
        let voices: Vec<AzureVoice> = self
            .client()?
            .get(url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(http_error)?
            .json()
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidData,
                    format!("Failed to parse voice list: {}", e),
                )
            })?;

        Ok(voices
            .into_iter()
            .map(|v| Voice {
                name: v.display_name.unwrap_or_else(|| v.short_name.clone()),
                id: v.short_name,
                locale: v.locale,
                gender: v.gender,
            })
            .collect())
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
        let voice_id = voice
            .or_else(|| self.voice.lock().ok().and_then(|v| v.clone()))
            .unwrap_or_else(|| DEFAULT_VOICE.to_string());

        let resp = self
            .client()?
            .post(format!("{}/cognitiveservices/v1", self.base_url))
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .body(build_ssml(&voice_id, text))
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(http_error)?;

        Ok(Box::new(ReadChunks::new(resp)))
    }
}
