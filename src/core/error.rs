use std::{io, path::PathBuf};

use thiserror::Error;

use crate::http::TransportError;

pub type Result<T, E = FetchError> = std::result::Result<T, E>;

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    Transient,
    Unauthorized,
    NotFound,
    Offline,
    Filesystem,
    Protocol,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid model reference '{0}'")]
    InvalidReference(String),

    #[error("invalid HF repo format '{0}', expected <user>/<model>[:quant]")]
    InvalidRepo(String),

    #[error("invalid OCI digest format received in manifest: {0}")]
    InvalidDigest(String),

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("download of {url} failed after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },

    #[error("transfer of {url} ended early: got {received} of {expected} bytes")]
    Truncated {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error(
        "model {repo} is private or does not exist; if you are accessing a gated model, please provide a valid token"
    )]
    Unauthorized { repo: String },

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("model {repo} does not have a downloadable GGUF file")]
    MissingArtifact { repo: String },

    #[error("no GGUF layer found in manifest for {repo}:{tag}")]
    NoModelLayer { repo: String, tag: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("required file is not available in cache (offline mode): {}", path.display())]
    NotCached { path: PathBuf },

    #[error("failed to get manifest for {repo}:{tag} (offline mode)")]
    ManifestOffline { repo: String, tag: String },

    #[error("failed to get manifest for {repo}:{tag} (check your internet connection)")]
    ManifestUnreachable { repo: String, tag: String },

    #[error("unexpected model file name {name} for n_split={count}")]
    SplitNameMismatch { name: String, count: u16 },

    #[error("invalid GGUF metadata in {}: {reason}", path.display())]
    InvalidMetadata { path: PathBuf, reason: String },

    #[error("{failed} of {total} downloads failed")]
    BatchFailed {
        failed: usize,
        total: usize,
        #[source]
        first: Box<FetchError>,
    },

    #[error("{action} {}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub(crate) fn fs(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference(_) | Self::InvalidRepo(_) | Self::InvalidDigest(_) => {
                ErrorKind::MalformedInput
            }
            Self::Transport { .. } | Self::RetriesExhausted { .. } | Self::Truncated { .. } => {
                ErrorKind::Transient
            }
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::MissingArtifact { .. } | Self::NoModelLayer { .. } => ErrorKind::NotFound,
            Self::NotCached { .. } | Self::ManifestOffline { .. } => ErrorKind::Offline,
            Self::ManifestUnreachable { .. } => ErrorKind::Transient,
            Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::HttpStatus { .. }
            | Self::InvalidManifest(_)
            | Self::SplitNameMismatch { .. }
            | Self::InvalidMetadata { .. } => ErrorKind::Protocol,
            Self::BatchFailed { first, .. } => first.kind(),
        }
    }

    /// Whether another attempt of the same transfer could succeed.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Truncated { .. })
    }
}
