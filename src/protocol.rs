//! JSON envelopes exchanged over the endpoint.

use serde::{Deserialize, Serialize};

use crate::backends::Voice;
use crate::error::DecodeError;

/// A decoded request. Each variant carries only the fields its action needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ListEngines,
    ListVoices {
        engine: String,
    },
    SetVoice {
        engine: String,
        voice: String,
    },
    Speak {
        engine: String,
        voice: Option<String>,
        text: String,
    },
}

/// The request as it appears on the wire. Clients send the same handful
/// of optional keys for every action.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RawRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_iso_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_voice_combo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::ListEngines => "list_engines",
            Request::ListVoices { .. } => "list_voices",
            Request::SetVoice { .. } => "set_voice",
            Request::Speak { .. } => "speak",
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawRequest = serde_json::from_slice(bytes)?;
        Request::try_from(raw)
    }

    pub fn encode(&self) -> Vec<u8> {
        // RawRequest only holds strings, serialization cannot fail
        serde_json::to_vec(&RawRequest::from(self)).unwrap_or_default()
    }
}

/// Split `Engine-voice-id` at the first dash.
fn split_combo(combo: &str) -> Option<(String, String)> {
    let (engine, voice) = combo.split_once('-')?;
    if engine.is_empty() || voice.is_empty() {
        return None;
    }
    Some((engine.to_string(), voice.to_string()))
}

impl TryFrom<RawRequest> for Request {
    type Error = DecodeError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let combo = raw.engine_voice_combo.as_deref().and_then(split_combo);

        match raw.action.as_str() {
            "list_engines" => Ok(Request::ListEngines),
            "list_voices" => {
                let engine = raw
                    .engine
                    .or_else(|| combo.map(|(engine, _)| engine))
                    .ok_or(DecodeError::MissingField {
                        action: "list_voices",
                        field: "engine",
                    })?;
                Ok(Request::ListVoices { engine })
            }
            "set_voice" => {
                let (engine, voice) = match (raw.engine, raw.voice_iso_code.or(raw.voice)) {
                    (Some(engine), Some(voice)) => (engine, voice),
                    // A bare voice_iso_code carries the engine as a prefix
                    (None, Some(code)) => split_combo(&code).ok_or(DecodeError::MissingField {
                        action: "set_voice",
                        field: "engine",
                    })?,
                    (engine, None) => match (engine, combo) {
                        (None, Some(pair)) => pair,
                        (Some(engine), Some((combo_engine, voice))) => {
                            if engine != combo_engine {
                                return Err(DecodeError::EngineMismatch {
                                    engine,
                                    combo_engine,
                                });
                            }
                            (engine, voice)
                        }
                        (_, None) => {
                            return Err(DecodeError::MissingField {
                                action: "set_voice",
                                field: "voice_iso_code",
                            })
                        }
                    },
                };
                Ok(Request::SetVoice { engine, voice })
            }
            "speak" | "speak_text" => {
                let (combo_engine, combo_voice) = combo.unzip();
                let engine = raw.engine.or(combo_engine).ok_or(DecodeError::MissingField {
                    action: "speak",
                    field: "engine",
                })?;
                let text = raw.text.ok_or(DecodeError::MissingField {
                    action: "speak",
                    field: "text",
                })?;
                let voice = raw.voice.or(raw.voice_iso_code).or(combo_voice);
                Ok(Request::Speak {
                    engine,
                    voice,
                    text,
                })
            }
            other => Err(DecodeError::UnknownAction(other.to_string())),
        }
    }
}

impl From<&Request> for RawRequest {
    fn from(request: &Request) -> Self {
        let mut raw = RawRequest {
            action: request.action().to_string(),
            ..RawRequest::default()
        };
        match request {
            Request::ListEngines => {}
            Request::ListVoices { engine } => raw.engine = Some(engine.clone()),
            Request::SetVoice { engine, voice } => {
                raw.engine = Some(engine.clone());
                raw.voice_iso_code = Some(voice.clone());
            }
            Request::Speak {
                engine,
                voice,
                text,
            } => {
                raw.engine = Some(engine.clone());
                raw.voice = voice.clone();
                raw.text = Some(text.clone());
            }
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voices: Option<Vec<Voice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            engines: None,
            voices: None,
            token: None,
            message: None,
        }
    }

    pub fn engines(engines: Vec<String>) -> Self {
        Self {
            engines: Some(engines),
            ..Self::with_status(Status::Success)
        }
    }

    pub fn voices(voices: Vec<Voice>) -> Self {
        Self {
            voices: Some(voices),
            ..Self::with_status(Status::Success)
        }
    }

    pub fn registered(token: String) -> Self {
        Self {
            token: Some(token),
            ..Self::with_status(Status::Success)
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(Status::Failure)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(Status::Error)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"status":"error","message":"failed to encode response"}"#.to_vec()
        })
    }
}
