use std::fmt;

/// Reusable VM detected: `build.sh` already exists on the instance's disk.
///
/// A distinct, equality-testable unit type so callers can write
/// `matches!(err, ProviderError::StaleVm(_))` the way a Go caller would do
/// `errors.Is(err, ErrStaleVM)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaleVmError;

impl fmt::Display for StaleVmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reused VM detected: build.sh already exists")
    }
}

impl std::error::Error for StaleVmError {}

/// One `{code, location, message}` entry from a cloud operation's error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationErrorEntry {
    pub code: String,
    pub location: Option<String>,
    pub message: String,
}

impl fmt::Display for OperationErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={}", self.code)?;
        if let Some(location) = &self.location {
            write!(f, " location={location}")?;
        }
        write!(f, " message={}", self.message)
    }
}

/// A zone operation that reached `DONE` carrying a non-empty error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudOperationError {
    pub entries: Vec<OperationErrorEntry>,
}

impl fmt::Display for CloudOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.entries.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(", "))
    }
}

impl std::error::Error for CloudOperationError {}

/// Every way this crate's public operations can fail, grouped by handling
/// policy rather than by originating subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Missing required option, malformed credential, bad PEM, bad
    /// passphrase, invalid selector type. The provider is never returned.
    #[error("configuration error: {0}")]
    Config(String),

    /// `Setup` could not resolve zone/machine-type/network.
    #[error("setup error: {0}")]
    Setup(String),

    /// A cloud operation reached `DONE` with a non-empty error payload.
    #[error("cloud operation failed: {0}")]
    CloudOperation(#[from] CloudOperationError),

    /// Transport-level failure talking to the cloud control plane.
    #[error("cloud transport error: {0}")]
    CloudTransport(#[source] anyhow::Error),

    /// `build.sh` already present on the instance; it must be discarded.
    #[error(transparent)]
    StaleVm(#[from] StaleVmError),

    /// SFTP upload exhausted its retry budget.
    #[error("upload failed after {attempts} attempt(s): {source}")]
    Upload {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// `RunScript` could not determine whether the remote command completed
    /// (transport or session failure). The caller should consider requeuing.
    #[error("remote execution outcome unknown: {0}")]
    RemoteUnknown(#[source] anyhow::Error),

    /// The caller's `CancellationToken` fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ProviderError {
    pub fn cloud_transport(err: impl Into<anyhow::Error>) -> Self {
        ProviderError::CloudTransport(err.into())
    }
}
