//! Varlink address URIs.
//!
//! Two schemes exist: `unix:PATH` and `tcp:HOST:PORT`, where `HOST` is an
//! IPv4 literal. Both may carry a trailing `/Interface.Method` naming a
//! single call, and anything from the first `;` on is reserved and ignored.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// The endpoint a varlink URI points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(SocketAddrV4),
}

/// A decoded varlink URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarlinkUri {
    pub address: Address,
    /// Interface part of a trailing `/Interface.Method`, if any.
    pub interface: Option<String>,
    /// Method part of a trailing `/Interface.Method`, if any.
    pub method: Option<String>,
}

impl VarlinkUri {
    /// Decode an address URI. A trailing `/Interface.Method` is only split
    /// off for `tcp:` URIs; a Unix path keeps all its slashes.
    pub fn parse(uri: &str) -> Result<VarlinkUri> {
        Self::parse_with_method(uri, false)
    }

    /// Decode an address URI. With `has_method`, the last `/`-separated
    /// segment names the call as `Interface.Method`, for `unix:` URIs too.
    pub fn parse_with_method(uri: &str, has_method: bool) -> Result<VarlinkUri> {
        let invalid = || Error::InvalidAddress(uri.into());
        let stripped = uri.split(';').next().unwrap_or(uri);

        let (payload, qualified) = if has_method || stripped.starts_with("tcp:") {
            match stripped.rfind('/') {
                Some(i) => (&stripped[..i], Some(&stripped[i + 1..])),
                None => (stripped, None),
            }
        } else {
            (stripped, None)
        };

        let (interface, method) = match qualified {
            Some(q) => {
                let dot = q.rfind('.').ok_or_else(invalid)?;
                if q[..dot].is_empty() || q[dot + 1..].is_empty() {
                    return Err(invalid());
                }
                (Some(q[..dot].to_string()), Some(q[dot + 1..].to_string()))
            }
            None => (None, None),
        };

        let address = if let Some(path) = payload.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            Address::Unix(PathBuf::from(path))
        } else if let Some(hostport) = payload.strip_prefix("tcp:") {
            let colon = hostport.rfind(':').ok_or_else(invalid)?;
            let host: Ipv4Addr = hostport[..colon].parse().map_err(|_| invalid())?;
            let port: u16 = hostport[colon + 1..].parse().map_err(|_| invalid())?;
            Address::Tcp(SocketAddrV4::new(host, port))
        } else {
            return Err(invalid());
        };

        Ok(VarlinkUri {
            address,
            interface,
            method,
        })
    }
}
