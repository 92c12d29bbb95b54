//! Async client side: calls queue on a fair lock and run one at a time.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::aio::connection::Connection;
use crate::error::{Error, Result};
use crate::message::{CallMode, Message, Reply};

/// An async varlink client.
///
/// Calls share the connection through a fair lock: a call holds it from the
/// moment its request is written until its final reply has been read, so
/// queued calls begin in submission order and replies always belong to the
/// active call.
pub struct Client {
    slot: Arc<Mutex<CallSlot>>,
}

struct CallSlot {
    connection: Connection,
    broken: bool,
}

impl Client {
    /// Connect to a varlink URI (`unix:PATH` or `tcp:HOST:PORT`).
    pub async fn connect(address: &str) -> Result<Client> {
        Ok(Client::with_connection(Connection::connect(address).await?))
    }

    /// Wrap an already connected transport.
    pub fn with_connection(connection: Connection) -> Client {
        Client {
            slot: Arc::new(Mutex::new(CallSlot {
                connection,
                broken: false,
            })),
        }
    }

    /// Call `method` with `parameters` (an object or null) in `mode`.
    pub async fn call(
        &self,
        method: &str,
        parameters: Value,
        mode: CallMode,
    ) -> Result<CallReplies> {
        self.call_message(&Message::new(method, parameters, mode)?)
            .await
    }

    /// Submit a prepared call. Resolves once the request is on the wire;
    /// for a oneway call the returned stream is already finished.
    pub async fn call_message(&self, message: &Message) -> Result<CallReplies> {
        let mut slot = Arc::clone(&self.slot).lock_owned().await;
        if slot.broken {
            return Err(Error::ConnectionClosed);
        }
        if let Err(e) = slot.connection.send(&message.to_request()).await {
            slot.broken = true;
            return Err(e);
        }
        if message.is_oneway() {
            return Ok(CallReplies {
                slot: None,
                wants_more: false,
                done: true,
            });
        }
        Ok(CallReplies {
            slot: Some(slot),
            wants_more: message.wants_more(),
            done: false,
        })
    }
}

/// The replies of one async call.
///
/// Holds the client's call slot until the final reply; dropping it earlier
/// poisons the connection, because unread replies would desynchronize the
/// next call.
pub struct CallReplies {
    slot: Option<OwnedMutexGuard<CallSlot>>,
    wants_more: bool,
    done: bool,
}

impl CallReplies {
    /// The next reply's parameters, or `None` after the final reply.
    ///
    /// An error reply terminates the stream and surfaces as `Err`; the
    /// connection stays healthy after an error reply.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let Some(slot) = self.slot.as_mut() else {
            return Ok(None);
        };

        let value = match slot.connection.receive().await {
            Ok(value) => value,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        let reply: Reply = match serde_json::from_value(value) {
            Ok(reply) => reply,
            Err(e) => {
                self.fail();
                return Err(e.into());
            }
        };

        // An error reply is always terminal, whatever `continues` says.
        let continues =
            self.wants_more && reply.continues == Some(true) && reply.error.is_none();
        if !continues {
            self.done = true;
            self.slot = None;
        }
        if reply.error.is_some() {
            return Err(reply.into());
        }
        match reply.parameters {
            Some(parameters) => Ok(Some(parameters)),
            None => Err(Error::InvalidMessage("reply without parameters".into())),
        }
    }

    fn fail(&mut self) {
        self.done = true;
        if let Some(mut slot) = self.slot.take() {
            slot.broken = true;
        }
    }
}

impl Drop for CallReplies {
    fn drop(&mut self) {
        if !self.done {
            if let Some(mut slot) = self.slot.take() {
                slot.broken = true;
            }
        }
    }
}
