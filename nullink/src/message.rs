//! The wire objects of the varlink protocol and the validated request form
//! the server dispatches on.

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// How a call wants to be answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// One request, one reply.
    Basic,
    /// Streamed replies until one without `continues`.
    More,
    /// No reply at all.
    Oneway,
    /// Reserved; answered like [`CallMode::Basic`].
    Upgrade,
}

/// The structure of a varlink request, used to (de)serialize the wire JSON.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// The structure of a varlink reply, used to (de)serialize the wire JSON.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continues: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Reply {
    pub fn parameters(parameters: Value) -> Self {
        Reply {
            continues: None,
            error: None,
            parameters: Some(parameters),
        }
    }

    pub fn error<S: Into<String>>(name: S, parameters: Value) -> Self {
        Reply {
            continues: None,
            error: Some(name.into()),
            parameters: Some(parameters),
        }
    }
}

/// A validated method call: the fully qualified method, its parameters
/// (always a JSON object) and its [`CallMode`].
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    method: String,
    parameters: Value,
    mode: CallMode,
}

impl Message {
    /// Build an outbound call. `parameters` must be a JSON object or null
    /// (taken as the empty object).
    pub fn new<S: Into<String>>(method: S, parameters: Value, mode: CallMode) -> Result<Message> {
        let parameters = match parameters {
            Value::Null => Value::Object(Map::new()),
            p @ Value::Object(_) => p,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "parameters is not an object: {}",
                    other
                )))
            }
        };
        Ok(Message {
            method: method.into(),
            parameters,
            mode,
        })
    }

    /// Parse-validate an inbound request.
    ///
    /// Requires a `method` string, an object `parameters` when present and
    /// at most one of the `more`/`oneway`/`upgrade` flags set.
    pub fn from_value(value: Value) -> Result<Message> {
        let malformed = || Error::InvalidMessage(value.to_string());
        let obj = value.as_object().ok_or_else(malformed)?;

        let method = match obj.get("method") {
            Some(Value::String(m)) => m.clone(),
            _ => return Err(malformed()),
        };
        let parameters = match obj.get("parameters") {
            None => Value::Object(Map::new()),
            Some(p @ Value::Object(_)) => p.clone(),
            Some(_) => return Err(malformed()),
        };

        let flag = |name: &str| matches!(obj.get(name), Some(Value::Bool(true)));
        let mode = match (flag("more"), flag("oneway"), flag("upgrade")) {
            (false, false, false) => CallMode::Basic,
            (true, false, false) => CallMode::More,
            (false, true, false) => CallMode::Oneway,
            (false, false, true) => CallMode::Upgrade,
            _ => return Err(malformed()),
        };

        Ok(Message {
            method,
            parameters,
            mode,
        })
    }

    /// The interface part of the method: everything before the last `.`,
    /// empty if the method is unqualified.
    pub fn interface(&self) -> &str {
        match self.method.rfind('.') {
            Some(i) => &self.method[..i],
            None => "",
        }
    }

    /// The bare method name: everything after the last `.`, empty if the
    /// method is unqualified.
    pub fn method(&self) -> &str {
        match self.method.rfind('.') {
            Some(i) => &self.method[i + 1..],
            None => "",
        }
    }

    /// The full `interface.Method` string as received.
    pub fn full_method(&self) -> &str {
        &self.method
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn is_oneway(&self) -> bool {
        self.mode == CallMode::Oneway
    }

    pub fn wants_more(&self) -> bool {
        self.mode == CallMode::More
    }

    /// The wire form of this call.
    pub fn to_request(&self) -> Request {
        let parameters = match &self.parameters {
            Value::Object(map) if map.is_empty() => None,
            p => Some(p.clone()),
        };
        Request {
            more: (self.mode == CallMode::More).then_some(true),
            oneway: (self.mode == CallMode::Oneway).then_some(true),
            upgrade: (self.mode == CallMode::Upgrade).then_some(true),
            method: self.method.clone(),
            parameters,
        }
    }
}
