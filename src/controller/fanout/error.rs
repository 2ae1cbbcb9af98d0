use std::{io, time::Duration};

use super::generation::Generation;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inventory service could not be reached or refused the request.
    #[error("inventory unreachable: {0}")]
    InventoryUnreachable(String),
    /// The inventory answered with something we can't interpret.
    #[error("malformed inventory response: {0}")]
    MalformedInventory(String),
    #[error("inventory did not answer within {0:?}")]
    InventoryTimeout(Duration),
    /// A write into the inactive generation's storage failed.
    #[error("table write failed: {0}")]
    TableWrite(String),
    #[error("table read failed: {0}")]
    TableRead(String),
    #[error("refusing to write into active generation {0}")]
    ActiveGenerationWrite(Generation),
    #[error("generation pointer holds {0}, expected 0 or 1")]
    BadGenerationPointer(u32),
    #[error("record of {got} bytes, expected {expected}")]
    BadRecordLength { expected: usize, got: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true for failures to obtain a topology snapshot.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Error::InventoryUnreachable(_)
                | Error::MalformedInventory(_)
                | Error::InventoryTimeout(_)
        )
    }

    /// Returns true for failures while populating or flipping tables.
    pub fn is_table_write(&self) -> bool {
        matches!(
            self,
            Error::TableWrite(_) | Error::ActiveGenerationWrite(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedInventory(e.to_string())
        } else {
            Self::InventoryUnreachable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedInventory(e.to_string())
    }
}

#[cfg(feature = "bpf")]
impl From<libbpf_rs::Error> for Error {
    fn from(e: libbpf_rs::Error) -> Self {
        Self::TableWrite(e.to_string())
    }
}
