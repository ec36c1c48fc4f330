//! JSON-RPC 2.0 client for the target daemon's Unix control socket.
//!
//! Calls are blocking and carry no socket timeout; the daemon is local.
//! Connection loss surfaces as [`RpcError::Closed`] rather than a hang on a
//! half-closed socket, since EOF on the read side ends the call.

use std::io::{self, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Result, RpcError};

/// Default location of the daemon's control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/spdk/spdk.sock";

/// Anything that can execute a named RPC against the daemon.
pub trait RpcClient {
    fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value>;
}

impl<C: RpcClient + ?Sized> RpcClient for &mut C {
    fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        (**self).call(method, params)
    }
}

impl<C: RpcClient + ?Sized> RpcClient for Box<C> {
    fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        (**self).call(method, params)
    }
}

/// Produces a fresh client for one unit of work.
pub trait Connect {
    type Client: RpcClient;

    fn connect(&self) -> Result<Self::Client>;

    /// Cheap liveness check that does not talk to the daemon.
    fn endpoint_present(&self) -> bool {
        true
    }
}

/// Connects to the daemon's Unix socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for UnixConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

impl Connect for UnixConnector {
    type Client = JsonRpcClient;

    fn connect(&self) -> Result<JsonRpcClient> {
        JsonRpcClient::connect(&self.path)
    }

    fn endpoint_present(&self) -> bool {
        self.path.exists()
    }
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// A connected JSON-RPC session over a Unix stream socket.
#[derive(Debug)]
pub struct JsonRpcClient {
    path: PathBuf,
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl JsonRpcClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |source| RpcError::Unavailable {
            path: path.clone(),
            source,
        };

        let stream = UnixStream::connect(&path).map_err(unavailable)?;
        let writer = stream.try_clone().map_err(unavailable)?;
        debug!("Connected to target daemon at {}", path.display());

        Ok(Self {
            path,
            reader: BufReader::new(stream),
            writer,
            next_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly one JSON value from the socket. Responses are not
    /// newline-delimited, so the stream deserializer is used to stop at the
    /// end of the first complete object.
    fn read_response(&mut self, method: &str) -> Result<Response> {
        let mut values = serde_json::Deserializer::from_reader(&mut self.reader).into_iter::<Response>();
        match values.next() {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) if e.is_io() || e.is_eof() => Err(RpcError::Closed {
                method: method.to_string(),
                source: io::Error::from(e),
            }),
            Some(Err(source)) => Err(RpcError::Decode {
                method: method.to_string(),
                source,
            }),
            None => Err(RpcError::Closed {
                method: method.to_string(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection"),
            }),
        }
    }
}

impl RpcClient for JsonRpcClient {
    fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        let request = Request {
            jsonrpc: "2.0",
            method,
            id,
            params,
        };
        let body = serde_json::to_vec(&request).map_err(|source| RpcError::Decode {
            method: method.to_string(),
            source,
        })?;

        self.writer
            .write_all(&body)
            .and_then(|()| self.writer.flush())
            .map_err(|source| RpcError::Closed {
                method: method.to_string(),
                source,
            })?;
        trace!(method, id, "Sent JSON-RPC request");

        let response = self.read_response(method)?;

        if let Some(error) = response.error {
            return Err(RpcError::from_daemon(method, error.code, error.message));
        }

        match response.id {
            Some(Value::Number(ref n)) if n.as_u64() == Some(id) => {}
            other => {
                return Err(RpcError::Protocol {
                    method: method.to_string(),
                    code: -32603,
                    message: format!("response id {:?} does not match request id {}", other, id),
                });
            }
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}
