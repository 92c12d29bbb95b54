//! Async server side: accept loop and per-connection session tasks.

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::aio::connection::{AsyncStream, Connection};
use crate::error::{Error, Result};
use crate::message::{Message, Reply};
use crate::service::Service;
use crate::uri::{Address, VarlinkUri};

/// Async listener for varlink connections. A bound Unix socket node is
/// unlinked when the listener is dropped.
pub enum AsyncListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl AsyncListener {
    /// Bind `unix:PATH` or `tcp:HOST:PORT`. Binding a Unix path that
    /// already exists fails.
    pub async fn bind(address: &str) -> Result<AsyncListener> {
        match VarlinkUri::parse(address)?.address {
            Address::Tcp(addr) => Ok(AsyncListener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            Address::Unix(path) => {
                let listener = UnixListener::bind(&path)?;
                Ok(AsyncListener::Unix(listener, path))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(Error::InvalidAddress(address.into())),
        }
    }

    pub async fn accept(&self) -> Result<Connection> {
        let stream = match self {
            AsyncListener::Tcp(listener) => AsyncStream::Tcp(listener.accept().await?.0),
            #[cfg(unix)]
            AsyncListener::Unix(listener, _) => AsyncStream::Unix(listener.accept().await?.0),
        };
        Ok(Connection::new(stream))
    }
}

impl Drop for AsyncListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let AsyncListener::Unix(_, path) = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Configuration for [`listen`].
pub struct ListenConfig {
    /// Return `Error::Timeout` when no connection arrives for this long.
    /// Zero disables the timeout.
    pub idle_timeout: Duration,

    /// When raised, stop accepting and return after the current accept
    /// window.
    pub stop_listening: Option<Arc<AtomicBool>>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            idle_timeout: Duration::ZERO,
            stop_listening: None,
        }
    }
}

/// Bind `address` and serve `service`, spawning one session task per
/// accepted connection. Failed accepts are logged and ignored.
pub async fn listen(service: Arc<Service>, address: &str, config: &ListenConfig) -> Result<()> {
    let listener = AsyncListener::bind(address).await?;
    tracing::debug!(address, "listening");

    loop {
        let bounded = !config.idle_timeout.is_zero() || config.stop_listening.is_some();
        let accepted = if bounded {
            let window = if config.stop_listening.is_some() {
                Duration::from_millis(100)
            } else {
                config.idle_timeout
            };
            match tokio::time::timeout(window, listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => {
                    if let Some(stop) = &config.stop_listening {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                    }
                    if !config.idle_timeout.is_zero() {
                        return Err(Error::Timeout);
                    }
                    continue;
                }
            }
        } else {
            listener.accept().await
        };

        let connection = match accepted {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = run_session(service, connection).await {
                tracing::warn!(error = %e, "session failed");
            }
        });
    }
}

/// One request/reply cycle at a time: read, dispatch, write the collected
/// replies in emission order, read again.
async fn run_session(service: Arc<Service>, mut connection: Connection) -> Result<()> {
    loop {
        let value = match connection.receive().await {
            Ok(value) => value,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let message = Message::from_value(value)?;
        tracing::debug!(method = message.full_method(), "dispatching");

        let mut pending: Vec<Reply> = Vec::new();
        {
            let mut sink = |reply: Reply| -> Result<()> {
                pending.push(reply);
                Ok(())
            };
            service.process_call(&message, &mut sink)?;
        }
        for reply in &pending {
            connection.send(reply).await?;
        }
    }
}
