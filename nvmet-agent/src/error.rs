use std::io;
use std::path::PathBuf;

use spdk_rpc::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NvmetError {
    /// A mutation failed; carries the resource class and the offending key.
    #[error("{resource} '{key}': {source}")]
    Rpc {
        resource: &'static str,
        key: String,
        #[source]
        source: RpcError,
    },

    #[error("failed to query {resource}: {source}")]
    Query {
        resource: &'static str,
        #[source]
        source: RpcError,
    },

    /// A daemon error not yet attributed to a resource.
    #[error(transparent)]
    Daemon(#[from] RpcError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("key material at {}: {source}", path.display())]
    KeyMaterial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl NvmetError {
    fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            NvmetError::Rpc { source, .. } | NvmetError::Query { source, .. } | NvmetError::Daemon(source) => {
                Some(source)
            }
            NvmetError::InvalidConfig(_) | NvmetError::KeyMaterial { .. } => None,
        }
    }

    /// True when the daemon reported the object as already absent.
    pub fn is_not_found(&self) -> bool {
        self.rpc_error().is_some_and(RpcError::is_not_found)
    }

    /// True when the daemon could not be reached; the caller should retry.
    pub fn is_unavailable(&self) -> bool {
        self.rpc_error().is_some_and(RpcError::is_unavailable)
    }

    /// Attach the resource class and key to an unattributed daemon error.
    pub(crate) fn attribute(self, resource: &'static str, key: &str) -> Self {
        match self {
            NvmetError::Daemon(source) => NvmetError::Rpc {
                resource,
                key: key.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Attribute an unattributed daemon error to a failed live query.
    pub(crate) fn query(self, resource: &'static str) -> Self {
        match self {
            NvmetError::Daemon(source) => NvmetError::Query { resource, source },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, NvmetError>;
