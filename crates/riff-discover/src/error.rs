//! Discovery error types

use crate::hardware::Backend;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while probing vendor runtimes.
///
/// None of these abort discovery: the cache folds them into
/// [`SystemSnapshot::discovery_errors`](crate::SystemSnapshot) and carries on
/// with whatever devices it could enumerate.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The shared library could not be opened or a required symbol is missing
    #[error("unable to load {backend} library {}: {reason}", path.display())]
    LibraryLoad {
        backend: Backend,
        path: PathBuf,
        reason: String,
    },

    /// The library opened but its init call failed
    #[error("unable to initialize {backend} library {}: {reason}", path.display())]
    Init {
        backend: Backend,
        path: PathBuf,
        reason: String,
    },

    /// Host driver is older than the library requires
    #[error(
        "version mismatch between driver and {backend} library - reboot or upgrade may be required: library {}",
        path.display()
    )]
    DriverMismatch { backend: Backend, path: PathBuf },

    /// The library initialized but reported no devices
    #[error("no {backend} devices detected by library {}", path.display())]
    NoDevices { backend: Backend, path: PathBuf },

    /// A single device could not be queried; the device was skipped
    #[error("failed to query {backend} device {index}: {reason}")]
    DeviceQuery {
        backend: Backend,
        index: usize,
        reason: String,
    },

    /// The discovery task was dropped before it completed
    #[error("discovery did not complete: {0}")]
    Interrupted(String),

    /// A discovery setting could not be parsed
    #[error("invalid discovery setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl DiscoveryError {
    /// True when the failure is a 32/64-bit mismatch of the library file.
    ///
    /// Such libraries are skipped silently during the search; they are
    /// expected on multilib hosts. Linux reports a wrong ELF class, Windows
    /// `ERROR_BAD_EXE_FORMAT` (193) in the loader error's source.
    pub fn is_wrong_architecture(&self) -> bool {
        match self {
            DiscoveryError::LibraryLoad { reason, .. } => {
                reason.contains("wrong ELF class") || reason.contains("os error 193")
            }
            _ => false,
        }
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
