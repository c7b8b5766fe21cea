//! Transport endpoints.
//!
//! Production traffic runs over VSOCK (`vsock://CID:PORT`). A TCP form
//! (`tcp://HOST:PORT`) stands in for VSOCK outside an enclave and in tests.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// CID of the parent instance as seen from inside an enclave.
pub const VSOCK_CID_HOST: u32 = 3;

/// Address of one side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireError::InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix("vsock://") {
            let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;
            let cid = cid.parse().map_err(|_| invalid())?;
            let port = port.parse().map_err(|_| invalid())?;
            Ok(Endpoint::Vsock { cid, port })
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            rest.parse().map(Endpoint::Tcp).map_err(|_| invalid())
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> String {
        endpoint.to_string()
    }
}
