//! Chunked framing over a duplex byte stream.
//!
//! Every physical chunk is a frame: a 4-byte big-endian length followed by
//! that many bytes, never more than `max_chunk`. How a message ends depends
//! on the [`Framing`] variant:
//!
//! - `Plain`: the first frame shorter than `max_chunk` is the last one. A
//!   payload that is empty or an exact multiple of `max_chunk` gets a
//!   trailing empty frame.
//! - `Compressed`: the payload is zlib-compressed and always ends with an
//!   empty frame.
//!
//! Audio streams always use the explicit empty terminator, so a missing
//! terminator tells the reader the stream was cut short.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Plain,
    Compressed,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_chunk: usize,
    max_message: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_chunk: usize, max_message: usize) -> Self {
        let max_chunk = max_chunk.max(1);
        Self {
            framing,
            max_chunk,
            max_message: max_message.max(max_chunk),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Read one complete message and return its (decompressed) payload.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Vec<u8>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut payload = Vec::new();
        let mut first = true;

        loop {
            let frame = match self.read_frame(reader).await? {
                Some(frame) => frame,
                None if first => return Err(CodecError::Closed),
                None => return Err(CodecError::Truncated),
            };
            first = false;

            let last = match self.framing {
                Framing::Plain => frame.len() < self.max_chunk,
                Framing::Compressed => frame.is_empty(),
            };

            if payload.len() + frame.len() > self.max_message {
                // Keep the stream in sync so the caller can still reply.
                if !last {
                    self.drain_message(reader).await?;
                }
                return Err(CodecError::MessageTooLarge {
                    max: self.max_message,
                });
            }
            payload.extend_from_slice(&frame);

            if last {
                break;
            }
        }

        match self.framing {
            Framing::Plain => Ok(payload),
            Framing::Compressed => decompress(&payload, self.max_message),
        }
    }

    /// Write `payload` as one message, compressing first if configured.
    pub async fn write_message<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        match self.framing {
            Framing::Plain => {
                let mut wrote_short = false;
                for chunk in payload.chunks(self.max_chunk) {
                    self.write_frame(writer, chunk).await?;
                    wrote_short = chunk.len() < self.max_chunk;
                }
                if !wrote_short {
                    self.write_frame(writer, &[]).await?;
                }
            }
            Framing::Compressed => {
                let compressed = compress(payload)?;
                for chunk in compressed.chunks(self.max_chunk) {
                    self.write_frame(writer, chunk).await?;
                }
                self.write_frame(writer, &[]).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Write part of an audio stream. Empty input writes nothing, since an
    /// empty frame would end the stream.
    pub async fn write_stream_chunk<W>(&self, writer: &mut W, data: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        for chunk in data.chunks(self.max_chunk) {
            self.write_frame(writer, chunk).await?;
        }
        Ok(())
    }

    pub async fn finish_stream<W>(&self, writer: &mut W) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_frame(writer, &[]).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Collect an audio stream up to its terminator. Stream size is not
    /// bounded by `max_message`.
    pub async fn read_stream<R>(&self, reader: &mut R) -> Result<Vec<u8>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut audio = Vec::new();
        loop {
            match self.read_frame(reader).await? {
                Some(frame) if frame.is_empty() => return Ok(audio),
                Some(frame) => audio.extend_from_slice(&frame),
                None => return Err(CodecError::Truncated),
            }
        }
    }

    async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_chunk {
            return Err(CodecError::Oversized {
                len,
                max: self.max_chunk,
            });
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::Truncated
            } else {
                CodecError::Io(e)
            }
        })?;
        Ok(Some(frame))
    }

    async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(frame.len() <= self.max_chunk);
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        if !frame.is_empty() {
            writer.write_all(frame).await?;
        }
        Ok(())
    }

    async fn drain_message<R>(&self, reader: &mut R) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = self.read_frame(reader).await?.ok_or(CodecError::Truncated)?;
            let last = match self.framing {
                Framing::Plain => frame.len() < self.max_chunk,
                Framing::Compressed => frame.is_empty(),
            };
            if last {
                return Ok(());
            }
        }
    }
}

/// Zlib-compress a payload.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Zlib-decompress a payload, refusing to inflate past `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    if out.len() > limit {
        return Err(CodecError::MessageTooLarge { max: limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CHUNK: usize = 16;

    fn codec(framing: Framing) -> FrameCodec {
        FrameCodec::new(framing, CHUNK, 1024 * 1024)
    }

    async fn round_trip(codec: &FrameCodec, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        codec.write_message(&mut wire, payload).await.unwrap();
        let mut reader = wire.as_slice();
        let decoded = codec.read_message(&mut reader).await.unwrap();
        assert!(reader.is_empty(), "decoder left bytes on the wire");
        decoded
    }

    #[tokio::test]
    async fn test_plain_round_trip_at_chunk_boundaries() {
        let codec = codec(Framing::Plain);
        for size in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert_eq!(round_trip(&codec, &payload).await, payload, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_compressed_round_trip_at_chunk_boundaries() {
        let codec = codec(Framing::Compressed);
        for size in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
            assert_eq!(round_trip(&codec, &payload).await, payload, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_gets_empty_terminator() {
        let codec = codec(Framing::Plain);
        let mut wire = Vec::new();
        codec.write_message(&mut wire, &[b'x'; CHUNK]).await.unwrap();
        // one full frame plus an empty terminator
        assert_eq!(wire.len(), 4 + CHUNK + 4);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_corrupt_compressed_payload_is_codec_error() {
        let codec = codec(Framing::Compressed);
        let mut wire = Vec::new();
        let garbage = b"definitely not zlib";
        for chunk in garbage.chunks(CHUNK) {
            wire.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            wire.extend_from_slice(chunk);
        }
        wire.extend_from_slice(&[0, 0, 0, 0]);

        let err = codec.read_message(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
        assert!(err.is_framing_intact());
    }

    #[tokio::test]
    async fn test_oversized_frame_breaks_framing() {
        let codec = codec(Framing::Plain);
        let mut wire = ((CHUNK + 1) as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; CHUNK + 1]);
        let err = codec.read_message(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::Oversized { .. }));
        assert!(!err.is_framing_intact());
    }

    #[tokio::test]
    async fn test_empty_connection_is_closed() {
        let codec = codec(Framing::Plain);
        let mut empty: &[u8] = &[];
        assert!(matches!(
            codec.read_message(&mut empty).await,
            Err(CodecError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_message_too_large_drains_remaining_frames() {
        let codec = FrameCodec::new(Framing::Plain, 4, 8);
        let mut wire = Vec::new();
        codec.write_message(&mut wire, b"0123456789abcdef").await.unwrap();
        wire.extend_from_slice(&[0, 0, 0, 1, b'z']);

        let mut reader = wire.as_slice();
        let err = codec.read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { max: 8 }));
        assert_eq!(reader, &[0, 0, 0, 1, b'z']);
    }

    #[tokio::test]
    async fn test_scripted_reads_split_across_frames() {
        let codec = FrameCodec::new(Framing::Plain, 4, 64);
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 4])
            .read(b"{\"a\"")
            .read(&[0, 0])
            .read(&[0, 2, b':', b'1'])
            .build();

        let payload = codec.read_message(&mut mock).await.unwrap();
        assert_eq!(payload, b"{\"a\":1");
    }

    #[tokio::test]
    async fn test_stream_without_terminator_is_truncated() {
        let codec = codec(Framing::Plain);
        let mut wire = Vec::new();
        codec.write_stream_chunk(&mut wire, &[1u8; 40]).await.unwrap();

        let err = codec.read_stream(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));

        codec.finish_stream(&mut wire).await.unwrap();
        assert_eq!(codec.read_stream(&mut wire.as_slice()).await.unwrap(), vec![1u8; 40]);
    }

    proptest! {
        #[test]
        fn prop_compressed_json_round_trips(text in "\\PC{0,200}", chunk in 1usize..64) {
            let payload = serde_json::to_vec(&serde_json::json!({ "action": "speak", "text": text })).unwrap();
            let codec = FrameCodec::new(Framing::Compressed, chunk, 1 << 20);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt.block_on(async {
                let mut wire = Vec::new();
                codec.write_message(&mut wire, &payload).await.unwrap();
                codec.read_message(&mut wire.as_slice()).await.unwrap()
            });
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decompress(&bytes, 1 << 16);
        }
    }
}
