use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Clone, Error)]
pub enum VitalsError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Network probe timed out after {0:?}")]
    NetworkTimeout(Duration),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Page body never became visible: {0}")]
    VisibilityWait(String),

    #[error("Measurement script failed: {0}")]
    Script(String),

    #[error("Browser probe timed out after {0:?}")]
    BrowserTimeout(Duration),

    #[error("Unexpected measurement result: {0}")]
    ResultParse(String),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Probe task failed: {0}")]
    TaskFailed(String),
}

/// Coarse classification used by the HTTP surface and the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any probing started
    Input,
    /// Raw network probe could not complete
    Transport,
    /// Browser session failed at some stage
    Browser,
    /// The in-page script answered with something we cannot read
    Parse,
    Cancelled,
    Internal,
}

impl VitalsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VitalsError::InvalidUrl(_) => ErrorKind::Input,
            VitalsError::Transport(_) | VitalsError::NetworkTimeout(_) => ErrorKind::Transport,
            VitalsError::BrowserLaunch(_)
            | VitalsError::Navigation(_)
            | VitalsError::VisibilityWait(_)
            | VitalsError::Script(_)
            | VitalsError::BrowserTimeout(_) => ErrorKind::Browser,
            VitalsError::ResultParse(_) => ErrorKind::Parse,
            VitalsError::Cancelled => ErrorKind::Cancelled,
            VitalsError::Configuration(_) | VitalsError::Io(_) | VitalsError::TaskFailed(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            VitalsError::NetworkTimeout(_) | VitalsError::BrowserTimeout(_)
        )
    }
}

impl From<std::io::Error> for VitalsError {
    fn from(err: std::io::Error) -> Self {
        VitalsError::Io(err.to_string())
    }
}

impl From<JoinError> for VitalsError {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            VitalsError::Cancelled
        } else {
            VitalsError::TaskFailed(err.to_string())
        }
    }
}
