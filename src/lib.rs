//! voice-engine-server: share speech-synthesis backends between local
//! processes over a single IPC endpoint and register their voices with the
//! system speech subsystem.

pub mod backends;
pub mod client;
pub mod codec;
pub mod config_loader;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod voice_registry;
