//! Accepting connections and running per-connection sessions.

#[cfg(unix)]
use std::fs;
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::{Message, Reply};
use crate::service::Service;
use crate::stream::Stream;
use crate::uri::{Address, VarlinkUri};

/// The listening half of a server. A bound Unix socket node is unlinked
/// when the listener is dropped.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind `unix:PATH` or `tcp:HOST:PORT`. Binding a Unix path that
    /// already exists fails.
    pub fn bind(address: &str) -> Result<Listener> {
        match VarlinkUri::parse(address)?.address {
            Address::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr)?)),
            #[cfg(unix)]
            Address::Unix(path) => {
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::Unix(listener, path))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(Error::InvalidAddress(address.into())),
        }
    }

    pub fn accept(&self) -> Result<Connection> {
        let stream: Box<dyn Stream> = match self {
            Listener::Tcp(l) => Box::new(l.accept()?.0),
            #[cfg(unix)]
            Listener::Unix(l, _) => Box::new(l.accept()?.0),
        };
        Ok(Connection::new(stream))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix(_, path) = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Per-connection server state: read a request, dispatch it, write the
/// replies, read the next request.
pub(crate) struct Session {
    connection: Connection,
    service: Arc<Service>,
}

impl Session {
    pub(crate) fn new(connection: Connection, service: Arc<Service>) -> Session {
        Session {
            connection,
            service,
        }
    }

    /// Serve until the peer disconnects. Protocol failures are answered on
    /// the wire and the loop continues; a malformed request or a transport
    /// failure ends the session.
    ///
    /// An `upgrade` call is answered like a basic call and the session goes
    /// on framing JSON; handing the raw socket to the handler is not
    /// supported.
    pub(crate) fn run(mut self) -> Result<()> {
        loop {
            let value = match self.connection.receive() {
                Ok(value) => value,
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let message = Message::from_value(value)?;
            tracing::debug!(method = message.full_method(), "dispatching");

            let connection = &mut self.connection;
            let mut sink = |reply: Reply| connection.send(&reply);
            self.service.process_call(&message, &mut sink)?;
        }
    }
}

/// Configuration for [`listen`].
pub struct ListenConfig {
    /// Worker threads serving accepted connections.
    pub workers: usize,

    /// Return `Error::Timeout` when no connection arrives for this long.
    /// Zero disables the timeout.
    pub idle_timeout: Duration,

    /// When raised, stop accepting and return after the current accept
    /// window.
    pub stop_listening: Option<Arc<AtomicBool>>,

    /// Receives the error of every failed session. Without one, failures
    /// are logged.
    pub error_handler: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            workers: 10,
            idle_timeout: Duration::ZERO,
            stop_listening: None,
            error_handler: None,
        }
    }
}

/// Bind `address` and serve `service`: accept forever, one session per
/// connection. Failed accepts are logged and ignored.
pub fn listen<S: ?Sized + AsRef<str>>(
    service: Service,
    address: &S,
    config: &ListenConfig,
) -> Result<()> {
    let service = Arc::new(service);
    let listener = Arc::new(Listener::bind(address.as_ref())?);
    let pool = ThreadPool::new(config.workers);
    tracing::debug!(address = address.as_ref(), "listening");

    let (sender, receiver) = mpsc::channel();
    {
        let listener = Arc::clone(&listener);
        thread::spawn(move || loop {
            if sender.send(listener.accept()).is_err() {
                break;
            }
        });
    }

    loop {
        if let Some(stop) = &config.stop_listening {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        let window = if config.stop_listening.is_some() {
            Duration::from_millis(100)
        } else {
            config.idle_timeout
        };

        let accepted = if window.is_zero() {
            receiver.recv().map_err(|_| Error::Aborted)?
        } else {
            match receiver.recv_timeout(window) {
                Ok(accepted) => accepted,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if config.stop_listening.is_some() {
                        continue;
                    }
                    return Err(Error::Timeout);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::Aborted),
            }
        };

        let connection = match accepted {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let service = Arc::clone(&service);
        let on_error = config.error_handler.clone();
        pool.execute(move || {
            if let Err(e) = Session::new(connection, service).run() {
                match &on_error {
                    Some(handler) => handler(&e),
                    None => tracing::warn!(error = %e, "session failed"),
                }
            }
        });
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// The `new` function panics if `size` is zero.
    fn new(size: usize) -> ThreadPool {
        assert!(size > 0);

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size)
            .map(|_| Worker::new(Arc::clone(&receiver)))
            .collect();

        ThreadPool {
            workers,
            sender: Some(sender),
        }
    }

    fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(f));
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Worker {
        let thread = thread::spawn(move || loop {
            let job = match receiver.lock().unwrap().recv() {
                Ok(job) => job,
                Err(_) => break,
            };
            job();
        });
        Worker {
            thread: Some(thread),
        }
    }
}
