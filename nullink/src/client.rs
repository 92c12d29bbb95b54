//! Blocking client side: serialized calls over one connection.

use std::sync::{Arc, Condvar, Mutex};

use serde_json::{json, Value};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::{CallMode, Message, Reply};
use crate::service::ServiceInfo;

/// A blocking varlink client.
///
/// All calls on one client share a FIFO: at most one call is on the wire at
/// a time, and a second call blocks until the first call's final reply has
/// been read. Replies therefore always belong to the oldest outstanding
/// call.
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    idle: Condvar,
}

struct State {
    connection: Option<Connection>,
    broken: bool,
}

impl Client {
    /// Connect to a varlink URI (`unix:PATH` or `tcp:HOST:PORT`).
    pub fn connect<S: ?Sized + AsRef<str>>(address: &S) -> Result<Client> {
        Ok(Client::with_connection(Connection::connect(
            address.as_ref(),
        )?))
    }

    /// Wrap an already connected transport.
    pub fn with_connection(connection: Connection) -> Client {
        Client {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    connection: Some(connection),
                    broken: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Call `method` with `parameters` (an object or null) in `mode`.
    pub fn call(&self, method: &str, parameters: Value, mode: CallMode) -> Result<ReplyStream> {
        self.call_message(&Message::new(method, parameters, mode)?)
    }

    /// Submit a prepared call and return its reply stream. For a oneway
    /// call the stream is already finished when this returns.
    pub fn call_message(&self, message: &Message) -> Result<ReplyStream> {
        let mut connection = self.take_connection()?;
        if let Err(e) = connection.send(&message.to_request()) {
            self.shared.poison();
            return Err(e);
        }
        if message.is_oneway() {
            self.shared.put_back(connection);
            return Ok(ReplyStream {
                shared: Arc::clone(&self.shared),
                connection: None,
                wants_more: false,
                done: true,
            });
        }
        Ok(ReplyStream {
            shared: Arc::clone(&self.shared),
            connection: Some(connection),
            wants_more: message.wants_more(),
            done: false,
        })
    }

    /// Call `org.varlink.service.GetInfo`.
    pub fn get_info(&self) -> Result<ServiceInfo> {
        let mut replies = self.call("org.varlink.service.GetInfo", Value::Null, CallMode::Basic)?;
        let parameters = replies.expect_one()?;
        Ok(serde_json::from_value(parameters)?)
    }

    /// Call `org.varlink.service.GetInterfaceDescription`.
    pub fn get_interface_description(&self, interface: &str) -> Result<String> {
        let mut replies = self.call(
            "org.varlink.service.GetInterfaceDescription",
            json!({ "interface": interface }),
            CallMode::Basic,
        )?;
        let parameters = replies.expect_one()?;
        match parameters.get("description").and_then(Value::as_str) {
            Some(description) => Ok(description.to_string()),
            None => Err(Error::InvalidMessage(parameters.to_string())),
        }
    }

    /// Block until no call is active, then take the connection.
    fn take_connection(&self) -> Result<Connection> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.broken {
                return Err(Error::ConnectionClosed);
            }
            if let Some(connection) = state.connection.take() {
                return Ok(connection);
            }
            state = self.shared.idle.wait(state).unwrap();
        }
    }
}

impl Shared {
    fn put_back(&self, connection: Connection) {
        let mut state = self.state.lock().unwrap();
        state.connection = Some(connection);
        drop(state);
        self.idle.notify_one();
    }

    fn poison(&self) {
        let mut state = self.state.lock().unwrap();
        state.broken = true;
        drop(state);
        self.idle.notify_all();
    }
}

/// The replies of one call, in arrival order.
///
/// Dropping the stream before its final reply would leave replies on the
/// wire for the next call to misread, so the client is poisoned instead and
/// later calls fail with `ConnectionClosed`.
pub struct ReplyStream {
    shared: Arc<Shared>,
    connection: Option<Connection>,
    wants_more: bool,
    done: bool,
}

impl ReplyStream {
    /// The next reply's parameters, or `None` after the final reply.
    ///
    /// An error reply terminates the stream and surfaces as `Err`, with the
    /// `org.varlink.service` errors mapped to their dedicated kinds. The
    /// connection stays healthy after an error reply.
    pub fn recv(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        let value = match connection.receive() {
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
            self.finish();
        }
        if reply.error.is_some() {
            return Err(reply.into());
        }
        match reply.parameters {
            Some(parameters) => Ok(Some(parameters)),
            None => Err(Error::InvalidMessage("reply without parameters".into())),
        }
    }

    fn expect_one(&mut self) -> Result<Value> {
        match self.recv()? {
            Some(parameters) => Ok(parameters),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(connection) = self.connection.take() {
            self.shared.put_back(connection);
        }
    }

    fn fail(&mut self) {
        self.done = true;
        self.connection = None;
        self.shared.poison();
    }
}

impl Iterator for ReplyStream {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Result<Value>> {
        self.recv().transpose()
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if !self.done && self.connection.is_some() {
            self.connection = None;
            self.shared.poison();
        }
    }
}
