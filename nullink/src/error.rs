use std::io;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::Reply;

/// Errors surfaced by the transport, the protocol layer and method handlers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[source] io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation aborted")]
    Aborted,

    #[error("timeout")]
    Timeout,

    #[error("invalid varlink address URI `{0}`")]
    InvalidAddress(String),

    #[error("{0}")]
    InvalidArgument(String),

    /// Malformed framing or JSON on the wire; carries the offending text.
    #[error("invalid varlink message: {0}")]
    InvalidMessage(String),

    #[error("JSON serialization error")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Idl(#[from] nullink_idl::ParseError),

    #[error("interface not found: `{0}`")]
    InterfaceNotFound(String),

    #[error("method not found: `{0}`")]
    MethodNotFound(String),

    #[error("method not implemented: `{0}`")]
    MethodNotImplemented(String),

    #[error("invalid parameter: `{0}`")]
    InvalidParameter(String),

    #[error("service error: {0}")]
    InternalError(String),

    /// An error reply with a name outside `org.varlink.service`, surfaced
    /// verbatim. Handlers may also return this to put a typed error on the
    /// wire.
    #[error("varlink error `{name}`")]
    VarlinkError { name: String, parameters: Value },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a typed varlink error to return from a method handler.
    pub fn varlink<S: Into<String>>(name: S, parameters: Value) -> Error {
        Error::VarlinkError {
            name: name.into(),
            parameters,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInterfaceNotFound {
    pub interface: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotFound {
    pub method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotImplemented {
    pub method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInvalidParameter {
    pub parameter: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInternal {
    pub what: Option<String>,
}

fn field<T: serde::de::DeserializeOwned + Default>(parameters: Option<Value>) -> T {
    parameters
        .and_then(|p| serde_json::from_value(p).ok())
        .unwrap_or_default()
}

impl From<Reply> for Error {
    fn from(reply: Reply) -> Self {
        let Some(name) = reply.error else {
            return Error::InvalidMessage("error reply without an error name".into());
        };
        match name.as_str() {
            "org.varlink.service.InterfaceNotFound" => Error::InterfaceNotFound(
                field::<ErrorInterfaceNotFound>(reply.parameters)
                    .interface
                    .unwrap_or_default(),
            ),
            "org.varlink.service.MethodNotFound" => Error::MethodNotFound(
                field::<ErrorMethodNotFound>(reply.parameters)
                    .method
                    .unwrap_or_default(),
            ),
            "org.varlink.service.MethodNotImplemented" => Error::MethodNotImplemented(
                field::<ErrorMethodNotImplemented>(reply.parameters)
                    .method
                    .unwrap_or_default(),
            ),
            "org.varlink.service.InvalidParameter" => Error::InvalidParameter(
                field::<ErrorInvalidParameter>(reply.parameters)
                    .parameter
                    .unwrap_or_default(),
            ),
            "org.varlink.service.InternalError" => Error::InternalError(
                field::<ErrorInternal>(reply.parameters)
                    .what
                    .unwrap_or_default(),
            ),
            _ => Error::VarlinkError {
                name,
                parameters: reply
                    .parameters
                    .unwrap_or_else(|| Value::Object(Default::default())),
            },
        }
    }
}
