/*!
Server and client support for the [varlink protocol](https://varlink.org).

Varlink is a JSON-framed RPC protocol over stream sockets. A service exposes
one or more interfaces described in a textual schema; every call names an
`interface.Method`, carries a parameter object and receives one reply, a
stream of replies (`more`), or none (`oneway`). Each wire message is a single
JSON value followed by one NUL byte.

# Server

A server is a [`Service`] with interfaces and their method handlers, bound
to an address with [`listen`]:

```rust,no_run
use std::collections::HashMap;

use nullink::{listen, ListenConfig, MethodHandler, Service};
use serde_json::json;

fn main() -> nullink::Result<()> {
    let mut service = Service::new("org.example", "ping service", "0.1", "https://example.org");

    let mut handlers = HashMap::new();
    handlers.insert(
        "Ping".to_string(),
        MethodHandler::sync(|parameters, _mode| Ok(json!({ "pong": parameters["ping"] }))),
    );
    service.add_interface(
        "interface org.example.ping\nmethod Ping(ping: string) -> (pong: string)",
        handlers,
    )?;

    listen(service, "unix:/run/org.example.ping", &ListenConfig::default())
}
```

Parameters are validated against the schema before a handler runs, and every
reply is validated before it goes on the wire. A streaming handler gets a
[`Call`] instead and emits replies itself:

```rust,no_run
# use nullink::{Call, MethodHandler};
# use serde_json::json;
let handler = MethodHandler::streaming(|parameters, _mode, call: &mut Call| {
    let n = parameters["n"].as_i64().unwrap_or(0);
    for m in 0..n {
        call.reply(json!({ "m": m }))?;
    }
    call.close(json!({ "m": n }))
});
```

# Client

A [`Client`] owns one connection and serializes its calls; replies arrive
through a [`ReplyStream`]:

```rust,no_run
use nullink::{CallMode, Client};
use serde_json::json;

fn main() -> nullink::Result<()> {
    let client = Client::connect("unix:/run/org.example.ping")?;
    let mut replies = client.call(
        "org.example.ping.Ping",
        json!({ "ping": "Test" }),
        CallMode::Basic,
    )?;
    while let Some(parameters) = replies.recv()? {
        println!("{}", parameters);
    }
    Ok(())
}
```

The async counterparts live in [`aio`] behind the `tokio` feature.
!*/

pub use crate::client::{Client, ReplyStream};
pub use crate::connection::Connection;
pub use crate::error::{Error, Result};
pub use crate::message::{CallMode, Message, Reply, Request};
pub use crate::server::{listen, ListenConfig, Listener};
pub use crate::service::{Call, MethodHandler, Service, ServiceInfo};
pub use crate::stream::Stream;
pub use crate::uri::{Address, VarlinkUri};

pub use nullink_idl as idl;

mod client;
mod connection;
pub mod error;
mod message;
mod server;
mod service;
mod stream;
mod uri;

#[cfg(feature = "tokio")]
pub mod aio;

#[cfg(test)]
mod test;
