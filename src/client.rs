//! Client side of the endpoint: one connection per request, the same
//! framing the server speaks.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::backends::Voice;
use crate::codec::FrameCodec;
use crate::config_loader::Settings;
use crate::error::ClientError;
use crate::protocol::{Request, Response};
use crate::transport::{ClientStream, Endpoint};

pub struct Client {
    endpoint: Endpoint,
    codec: FrameCodec,
}

impl Client {
    pub fn new(endpoint: Endpoint, codec: FrameCodec) -> Self {
        Self { endpoint, codec }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Endpoint::from_settings(settings), settings.codec())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<ClientStream, ClientError> {
        self.endpoint
            .connect()
            .await
            .map_err(|source| ClientError::Connect {
                endpoint: self.endpoint.address().to_string(),
                source,
            })
    }

    /// Send `request` and read back its JSON response. The response is
    /// returned whatever its status.
    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = self.open().await?;
        self.exchange(&mut stream, request).await
    }

    pub async fn exchange<S>(&self, stream: &mut S, request: &Request) -> Result<Response, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send(stream, request).await?;
        let bytes = self.codec.read_message(stream).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Synthesize `text` and collect the whole audio stream.
    pub async fn speak(&self, engine: &str, voice: Option<&str>, text: &str) -> Result<Vec<u8>, ClientError> {
        let mut stream = self.open().await?;
        self.speak_over(&mut stream, engine, voice, text).await
    }

    pub async fn speak_over<S>(
        &self,
        stream: &mut S,
        engine: &str,
        voice: Option<&str>,
        text: &str,
    ) -> Result<Vec<u8>, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = Request::Speak {
            engine: engine.to_string(),
            voice: voice.map(str::to_string),
            text: text.to_string(),
        };
        self.send(stream, &request).await?;
        let audio = self.codec.read_stream(stream).await?;

        // Errors raised before any audio arrive as a JSON body in the stream
        if audio.first() == Some(&b'{') {
            if let Ok(response) = serde_json::from_slice::<Response>(&audio) {
                return Err(rejected(response));
            }
        }
        debug!("Received {} bytes of audio", audio.len());
        Ok(audio)
    }

    pub async fn list_engines(&self) -> Result<Vec<String>, ClientError> {
        let response = successful(self.request(&Request::ListEngines).await?)?;
        Ok(response.engines.unwrap_or_default())
    }

    pub async fn list_voices(&self, engine: &str) -> Result<Vec<Voice>, ClientError> {
        let request = Request::ListVoices {
            engine: engine.to_string(),
        };
        let response = successful(self.request(&request).await?)?;
        Ok(response.voices.unwrap_or_default())
    }

    /// Register `voice` of `engine`; returns the voice token.
    pub async fn set_voice(&self, engine: &str, voice: &str) -> Result<String, ClientError> {
        let request = Request::SetVoice {
            engine: engine.to_string(),
            voice: voice.to_string(),
        };
        let response = successful(self.request(&request).await?)?;
        Ok(response.token.unwrap_or_default())
    }

    async fn send<S>(&self, stream: &mut S, request: &Request) -> Result<(), ClientError>
    where
        S: AsyncWrite + Unpin,
    {
        self.codec.write_message(stream, &request.encode()).await?;
        Ok(())
    }
}

fn successful(response: Response) -> Result<Response, ClientError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(rejected(response))
    }
}

fn rejected(response: Response) -> ClientError {
    ClientError::Rejected {
        status: response.status.as_str().to_string(),
        message: response.message.unwrap_or_default(),
    }
}
