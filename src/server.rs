use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use crate::dispatcher::Dispatcher;
use crate::transport::Acceptor;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop: one request per connection, each handed to the dispatcher.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    concurrent: bool,
    connections: AtomicU64,
}

impl Server {
    pub fn new(dispatcher: Arc<Dispatcher>, concurrent: bool) -> Self {
        Self {
            dispatcher,
            concurrent,
            connections: AtomicU64::new(0),
        }
    }

    /// Total connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Serve connections until the process exits. Nothing a client does
    /// stops the loop.
    pub async fn serve<A: Acceptor>(&self, mut acceptor: A) {
        info!(concurrent = self.concurrent, "Voice engine server accepting connections");

        loop {
            let stream = match acceptor.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
            let dispatcher = self.dispatcher.clone();
            let span = info_span!("connection", id);
            let task = async move {
                let mut stream = stream;
                if let Err(e) = dispatcher.serve_connection(&mut stream).await {
                    warn!("Connection error: {}", e);
                }
            }
            .instrument(span);

            if self.concurrent {
                tokio::spawn(task);
            } else {
                task.await;
            }
        }
    }

    /// Serve until `shutdown` completes. In-flight spawned connections are
    /// left to finish on the runtime.
    pub async fn serve_until<A, F>(&self, acceptor: A, shutdown: F)
    where
        A: Acceptor,
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.serve(acceptor) => {}
            _ = shutdown => info!("Shutdown requested, no longer accepting connections"),
        }
    }
}
