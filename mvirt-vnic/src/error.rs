//! Error types for the vNIC layer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building, encoding or decoding interface devices.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid PCI address: {0}")]
    InvalidPciAddress(String),

    #[error("Invalid prefix length: {0} (must be between 0 and 32)")]
    InvalidPrefix(u8),

    #[error("Failed to parse XML: {0}")]
    XmlParse(String),

    #[error("Failed to write XML: {0}")]
    XmlWrite(String),

    /// The device has no IOMMU group, so it cannot be isolated or handed back.
    #[error("IOMMU isolation unsupported for device {0}")]
    IsolationUnsupported(String),

    #[error("Hostdev helper failed: {0}")]
    Helper(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
