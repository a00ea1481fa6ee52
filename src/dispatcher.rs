//! Routes one decoded request to its backend and writes exactly one
//! terminal answer: a JSON response, or for `speak` an audio stream.
//!
//! `speak` failures before the first audio byte are reported as an error
//! response carried inside the stream framing. Failures after audio has
//! started leave the stream without its terminator, which the client must
//! treat as a failed synthesis.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backends::Voice;
use crate::codec::FrameCodec;
use crate::error::{CodecError, DispatchError};
use crate::protocol::{Request, Response};
use crate::registry::BackendRegistry;
use crate::voice_registry::{RegistrationRecord, VoiceRegistrar};

/// Audio chunks buffered between the synthesis thread and the socket.
const STREAM_BUFFER: usize = 8;

/// How long a client may take to deliver its request.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    registrar: Arc<VoiceRegistrar>,
    codec: FrameCodec,
    read_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<BackendRegistry>, registrar: Arc<VoiceRegistrar>, codec: FrameCodec) -> Self {
        Self {
            registry,
            registrar,
            codec,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Read one request from `stream`, answer it, and shut the write half
    /// down. Errors mean the connection could not be answered at all.
    pub async fn serve_connection<S>(&self, stream: &mut S) -> Result<(), CodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.answer(stream).await;
        // The peer may already be gone
        let _ = stream.shutdown().await;
        result
    }

    async fn answer<S>(&self, stream: &mut S) -> Result<(), CodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let read = tokio::time::timeout(self.read_timeout, self.codec.read_message(stream)).await;
        let Ok(read) = read else {
            warn!("No request within {:?}, dropping connection", self.read_timeout);
            return Err(CodecError::TimedOut(self.read_timeout));
        };

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.is_framing_intact() => {
                warn!("Undecodable message: {}", e);
                return self.respond(stream, Response::error(e.to_string())).await;
            }
            Err(e) => return Err(e),
        };

        debug!("Received data: {}", String::from_utf8_lossy(&bytes[..bytes.len().min(50)]));

        match Request::decode(&bytes) {
            Ok(request) => self.handle(request, stream).await,
            Err(e) => {
                warn!("Rejected request: {}", e);
                self.respond(stream, Response::error(e.to_string())).await
            }
        }
    }

    /// Handle one request, writing its answer to `sink`.
    pub async fn handle<W>(&self, request: Request, sink: &mut W) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        info!(action = request.action(), "Handling request");

        match request {
            Request::ListEngines => {
                let response = Response::engines(self.registry.available_names());
                self.respond(sink, response).await
            }
            Request::ListVoices { engine } => {
                let response = match self.list_voices(&engine).await {
                    Ok(voices) if voices.is_empty() => {
                        error!("No voices found for engine: {}", engine);
                        Response::error("No voices found")
                    }
                    Ok(voices) => {
                        info!("Fetched {} voices for engine: {}", voices.len(), engine);
                        Response::voices(voices)
                    }
                    Err(e) => {
                        error!("Error fetching voices for engine {}: {}", engine, e);
                        Response::error(e.to_string())
                    }
                };
                self.respond(sink, response).await
            }
            Request::SetVoice { engine, voice } => {
                let response = match self.set_voice(&engine, &voice).await {
                    Ok(record) => Response::registered(record.token),
                    Err(DispatchError::Registration(e)) => {
                        error!("Error registering voice {} for {}: {}", voice, engine, e);
                        Response::failure(e.to_string())
                    }
                    Err(e) => {
                        warn!("Cannot register voice {} for {}: {}", voice, engine, e);
                        Response::error(e.to_string())
                    }
                };
                self.respond(sink, response).await
            }
            Request::Speak {
                engine,
                voice,
                text,
            } => self.speak(&engine, voice, text, sink).await,
        }
    }

    async fn respond<W>(&self, sink: &mut W, response: Response) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.codec.write_message(sink, &response.to_bytes()).await
    }

    async fn list_voices(&self, engine: &str) -> Result<Vec<Voice>, DispatchError> {
        let backend = self.registry.lookup(engine)?;
        let voices = tokio::task::spawn_blocking(move || backend.list_voices()).await??;
        Ok(voices)
    }

    async fn set_voice(&self, engine: &str, voice_id: &str) -> Result<RegistrationRecord, DispatchError> {
        let voice = self
            .list_voices(engine)
            .await?
            .into_iter()
            // The voice selection client sends display names
            .find(|v| v.id == voice_id || v.name == voice_id)
            .ok_or_else(|| DispatchError::VoiceNotFound {
                engine: engine.to_string(),
                voice: voice_id.to_string(),
            })?;

        let vendor = self.registry.lookup(engine)?.vendor().map(str::to_string);
        let registrar = self.registrar.clone();
        let engine = engine.to_string();

        let record = tokio::task::spawn_blocking(move || {
            registrar.register_voice(&engine, vendor.as_deref(), &voice)
        })
        .await??;
        Ok(record)
    }

    async fn speak<W>(
        &self,
        engine: &str,
        voice: Option<String>,
        text: String,
        sink: &mut W,
    ) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let backend = match self.registry.lookup(engine) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Cannot speak: {}", e);
                return self.respond_in_stream(sink, Response::error(e.to_string())).await;
            }
        };

        info!(
            "Speaking text with {}: {}...",
            engine,
            text.chars().take(50).collect::<String>()
        );

        let (tx, mut rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(STREAM_BUFFER);
        let synth = tokio::task::spawn_blocking(move || {
            match backend.speak_streamed(&text, voice) {
                Ok(chunks) => {
                    for chunk in chunks {
                        // Receiver gone: the client disconnected
                        if tx.blocking_send(chunk).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        let mut written = 0usize;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    self.codec.write_stream_chunk(sink, &chunk).await?;
                    written += chunk.len();
                }
                Err(e) if written == 0 => {
                    error!("Error streaming TTS audio: {}", e);
                    return self.respond_in_stream(sink, Response::error(e.to_string())).await;
                }
                Err(e) => {
                    error!("TTS stream failed after {} bytes: {}", written, e);
                    return Ok(());
                }
            }
        }

        if let Err(e) = synth.await {
            error!("Synthesis task failed after {} bytes: {}", written, e);
            if written == 0 {
                return self.respond_in_stream(sink, Response::error(e.to_string())).await;
            }
            return Ok(());
        }

        self.codec.finish_stream(sink).await?;
        info!("Finished streaming {} bytes of TTS audio", written);
        Ok(())
    }

    async fn respond_in_stream<W>(&self, sink: &mut W, response: Response) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.codec.write_stream_chunk(sink, &response.to_bytes()).await?;
        self.codec.finish_stream(sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockBackend;
    use crate::backends::{AudioChunks, SpeechBackend};
    use crate::codec::Framing;
    use crate::protocol::Status;
    use crate::voice_registry::{MemoryStore, RegistrationLayout};
    use std::io::{Error, ErrorKind};

    fn voice(id: &str, name: &str) -> Voice {
        Voice {
            id: id.into(),
            name: name.into(),
            locale: None,
            gender: None,
        }
    }

    fn dispatcher(backends: Vec<(&str, MockBackend)>) -> (Dispatcher, Arc<MemoryStore>) {
        let registry = BackendRegistry::probe(backends.into_iter().map(|(name, mut mock)| {
            mock.expect_id().return_const("mock");
            (name.to_string(), Ok(Arc::new(mock) as Arc<dyn SpeechBackend>))
        }));
        let store = Arc::new(MemoryStore::new());
        let registrar = VoiceRegistrar::new(
            store.clone(),
            RegistrationLayout {
                token_prefix: "PYTTS".into(),
                adapter_class: "Adapter".into(),
                adapter_module: "adapter.dll".into(),
                voice_module: "voices".into(),
                runtime_path: "/opt/voices".into(),
            },
        );
        let codec = FrameCodec::new(Framing::Plain, 32, 1 << 20);
        (
            Dispatcher::new(Arc::new(registry), Arc::new(registrar), codec),
            store,
        )
    }

    async fn call(dispatcher: &Dispatcher, request: Request) -> Response {
        let mut sink = Vec::new();
        dispatcher.handle(request, &mut sink).await.unwrap();
        let bytes = dispatcher.codec().read_message(&mut sink.as_slice()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn listing(voices: Vec<Voice>) -> MockBackend {
        let mut mock = MockBackend::new();
        mock.expect_list_voices().returning(move || Ok(voices.clone()));
        mock
    }

    #[tokio::test]
    async fn test_list_voices_on_missing_engine_is_an_error() {
        let (dispatcher, _) = dispatcher(vec![]);
        let response = call(&dispatcher, Request::ListVoices { engine: "Missing".into() }).await;
        assert_eq!(response.status, Status::Error);
        assert!(response.message.unwrap().contains("Missing"));
    }

    #[tokio::test]
    async fn test_empty_voice_list_is_an_error() {
        let (dispatcher, _) = dispatcher(vec![("Sherpa", listing(vec![]))]);
        let response = call(&dispatcher, Request::ListVoices { engine: "Sherpa".into() }).await;
        assert_eq!(response, Response::error("No voices found"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let mut mock = MockBackend::new();
        let mut probed = false;
        mock.expect_list_voices().returning(move || {
            if !probed {
                probed = true;
                Ok(vec![])
            } else {
                Err(Error::new(ErrorKind::TimedOut, "provider timed out"))
            }
        });
        let (dispatcher, _) = dispatcher(vec![("Polly", mock)]);
        let response = call(&dispatcher, Request::ListVoices { engine: "Polly".into() }).await;
        assert_eq!(response, Response::error("provider timed out"));
    }

    #[tokio::test]
    async fn test_set_voice_registers_by_id_or_name() {
        let (dispatcher, store) = dispatcher(vec![(
            "Microsoft",
            listing(vec![voice("en-US-Jenny", "Jenny"), voice("en-GB-Ryan", "Ryan")]),
        )]);

        let by_id = call(
            &dispatcher,
            Request::SetVoice { engine: "Microsoft".into(), voice: "en-US-Jenny".into() },
        )
        .await;
        assert!(by_id.is_success());
        assert_eq!(by_id.token.as_deref(), Some("PYTTS-Microsoft-en-US-Jenny"));

        let by_name = call(
            &dispatcher,
            Request::SetVoice { engine: "Microsoft".into(), voice: "Ryan".into() },
        )
        .await;
        assert_eq!(by_name.token.as_deref(), Some("PYTTS-Microsoft-en-GB-Ryan"));

        // adapter plus two voices, each in both views
        assert_eq!(store.snapshot().len(), 6);
    }

    #[tokio::test]
    async fn test_set_voice_unknown_voice_is_an_error() {
        let (dispatcher, store) = dispatcher(vec![("Microsoft", listing(vec![voice("a", "A")]))]);
        let response = call(
            &dispatcher,
            Request::SetVoice { engine: "Microsoft".into(), voice: "zz".into() },
        )
        .await;
        assert_eq!(response.status, Status::Error);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_speak_streams_audio_with_terminator() {
        let mut mock = listing(vec![voice("en", "English")]);
        mock.expect_set_voice().never();
        mock.expect_speak_streamed()
            .withf(|text: &str, voice: &Option<String>| text == "hi" && voice.as_deref() == Some("en"))
            .times(1)
            .returning(|_, _| {
            let chunks: AudioChunks = Box::new(vec![Ok(vec![1u8; 50]), Ok(vec![]), Ok(vec![2u8; 10])].into_iter());
            Ok(chunks)
        });
        let (dispatcher, _) = dispatcher(vec![("Espeak", mock)]);

        let mut sink = Vec::new();
        dispatcher
            .handle(
                Request::Speak { engine: "Espeak".into(), voice: Some("en".into()), text: "hi".into() },
                &mut sink,
            )
            .await
            .unwrap();

        let audio = dispatcher.codec().read_stream(&mut sink.as_slice()).await.unwrap();
        assert_eq!(audio.len(), 60);
        assert_eq!(&audio[50..], &[2u8; 10]);
    }

    #[tokio::test]
    async fn test_speak_failure_mid_stream_leaves_no_terminator() {
        let mut mock = listing(vec![voice("en", "English")]);
        mock.expect_speak_streamed().returning(|_, _| {
            let chunks: AudioChunks = Box::new(
                vec![Ok(vec![1u8; 8]), Err(Error::new(ErrorKind::BrokenPipe, "synth died"))].into_iter(),
            );
            Ok(chunks)
        });
        let (dispatcher, _) = dispatcher(vec![("Espeak", mock)]);

        let mut sink = Vec::new();
        dispatcher
            .handle(Request::Speak { engine: "Espeak".into(), voice: None, text: "hi".into() }, &mut sink)
            .await
            .unwrap();

        let err = dispatcher.codec().read_stream(&mut sink.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[tokio::test]
    async fn test_concurrent_speaks_keep_their_own_voice() {
        let mut mock = listing(vec![voice("voiceA", "A"), voice("voiceB", "B")]);
        mock.expect_set_voice().never();
        mock.expect_speak_streamed().times(2).returning(|_, voice| {
            // Slow synthesis so both requests are in flight together
            std::thread::sleep(Duration::from_millis(100));
            let audio = voice.unwrap_or_default().into_bytes();
            let chunks: AudioChunks = Box::new(vec![Ok(audio)].into_iter());
            Ok(chunks)
        });
        let (dispatcher, _) = dispatcher(vec![("Espeak", mock)]);

        let dispatcher = &dispatcher;
        let speak = move |voice: &str| {
            let request = Request::Speak {
                engine: "Espeak".into(),
                voice: Some(voice.into()),
                text: "hi".into(),
            };
            async move {
                let mut sink = Vec::new();
                dispatcher.handle(request, &mut sink).await.unwrap();
                dispatcher.codec().read_stream(&mut sink.as_slice()).await.unwrap()
            }
        };

        let (a, b) = tokio::join!(speak("voiceA"), speak("voiceB"));
        assert_eq!(a, b"voiceA");
        assert_eq!(b, b"voiceB");
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (dispatcher, _) = dispatcher(vec![]);
        let dispatcher = dispatcher.with_read_timeout(Duration::from_millis(50));
        let (_client, mut server) = tokio::io::duplex(4096);

        let err = dispatcher.serve_connection(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_speak_on_missing_engine_answers_in_stream() {
        let (dispatcher, _) = dispatcher(vec![]);
        let mut sink = Vec::new();
        dispatcher
            .handle(Request::Speak { engine: "Nope".into(), voice: None, text: "hi".into() }, &mut sink)
            .await
            .unwrap();

        let body = dispatcher.codec().read_stream(&mut sink.as_slice()).await.unwrap();
        let response: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.status, Status::Error);
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_response() {
        let (dispatcher, _) = dispatcher(vec![]);
        let (mut client, mut server) = tokio::io::duplex(4096);

        let codec = dispatcher.codec().clone();
        let serve = async { dispatcher.serve_connection(&mut server).await };
        let talk = async {
            codec.write_message(&mut client, b"{\"action\": ").await.unwrap();
            codec.read_message(&mut client).await.unwrap()
        };
        let (served, reply) = tokio::join!(serve, talk);
        served.unwrap();

        let response: Response = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response.message.unwrap().starts_with("malformed request"));
    }
}
