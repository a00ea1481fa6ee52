//! The local endpoint: a named pipe on Windows, a Unix domain socket
//! elsewhere. Both hand out plain duplex byte streams.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config_loader::Settings;

/// Source of inbound connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

/// Where the server listens and where clients connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    address: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    #[cfg(unix)]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.socket_path().to_string_lossy())
    }

    #[cfg(windows)]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(format!(r"\\.\pipe\{}", settings.endpoint_name))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(unix)]
pub use unix::{ClientStream, ServerAcceptor};
#[cfg(windows)]
pub use windows::{ClientStream, ServerAcceptor};

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};
    use tracing::{debug, warn};

    pub type ClientStream = UnixStream;

    #[derive(Debug)]
    pub struct ServerAcceptor {
        listener: UnixListener,
        path: PathBuf,
    }

    #[async_trait]
    impl Acceptor for ServerAcceptor {
        type Stream = UnixStream;

        async fn accept(&mut self) -> io::Result<UnixStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for ServerAcceptor {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!("Could not remove socket {}: {}", self.path.display(), e);
            }
        }
    }

    impl Endpoint {
        pub fn bind(&self) -> io::Result<ServerAcceptor> {
            let path = PathBuf::from(&self.address);
            if path.exists() {
                // A live server still answers; anything else is a stale file
                if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("another server is listening on {}", path.display()),
                    ));
                }
                warn!("Removing stale socket {}", path.display());
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(&path)?;
            Ok(ServerAcceptor { listener, path })
        }

        pub async fn connect(&self) -> io::Result<UnixStream> {
            UnixStream::connect(&self.address).await
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    const ERROR_PIPE_BUSY: i32 = 231;

    pub type ClientStream = NamedPipeClient;

    #[derive(Debug)]
    pub struct ServerAcceptor {
        name: String,
        next: NamedPipeServer,
    }

    #[async_trait]
    impl Acceptor for ServerAcceptor {
        type Stream = NamedPipeServer;

        async fn accept(&mut self) -> io::Result<NamedPipeServer> {
            self.next.connect().await?;
            // Open the next instance before handing this one out
            let fresh = ServerOptions::new().create(&self.name)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }
    }

    impl Endpoint {
        pub fn bind(&self) -> io::Result<ServerAcceptor> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.address)?;
            Ok(ServerAcceptor {
                name: self.address.clone(),
                next,
            })
        }

        pub async fn connect(&self) -> io::Result<NamedPipeClient> {
            let mut attempts = 0;
            loop {
                match ClientOptions::new().open(&self.address) {
                    Ok(client) => return Ok(client),
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < 20 => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
