use std::time::Duration;
use thiserror::Error;

/// Renderer message fragments that mean the page or its target went away.
const PAGE_LOST_MARKERS: [&str; 3] = ["detached", "closed", "Target closed"];

/// Renderer message fragments that mean a navigation or wait ran out of time.
const TIMEOUT_MARKERS: [&str; 2] = ["timeout", "Timeout"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Target element not found: {0}")]
    TargetElementNotFound(String),

    #[error("Page lost, retry required: {0}")]
    PageLost(String),

    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Page load timed out: {0}")]
    PageLoadTimeout(String),

    #[error("Unsupported screenshot format: {0}")]
    UnsupportedFormat(String),

    #[error("Render engine is not initialized")]
    EngineNotInitialized,

    #[error("Render engine closed, task cancelled")]
    EngineClosed,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RenderError {
    /// Only a lost page is worth another attempt; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RenderError::PageLost(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RenderError::InvalidPath(_)
            | RenderError::FileNotFound(_)
            | RenderError::TargetElementNotFound(_)
            | RenderError::UnsupportedFormat(_) => ErrorSeverity::Low,
            RenderError::EngineClosed | RenderError::Configuration(_) => ErrorSeverity::High,
            RenderError::BrowserLaunchFailed(_) | RenderError::EngineNotInitialized => {
                ErrorSeverity::Critical
            }
            _ => ErrorSeverity::Medium,
        }
    }

    /// Whether the page that produced this error must be closed instead of pooled.
    ///
    /// Path validation fails before the page is touched, so the page stays reusable.
    pub fn taints_page(&self) -> bool {
        !matches!(
            self,
            RenderError::InvalidPath(_) | RenderError::FileNotFound(_)
        )
    }

    /// Remaps a raw renderer message into the typed taxonomy.
    ///
    /// `context` names what was being loaded (artifact path or virtual URL) and ends up in
    /// the page-load timeout message. Errors that are already typed pass through untouched.
    pub fn classify(self, context: &str) -> RenderError {
        match self {
            RenderError::Browser(message) => {
                if PAGE_LOST_MARKERS.iter().any(|marker| message.contains(marker)) {
                    RenderError::PageLost(message)
                } else if TIMEOUT_MARKERS.iter().any(|marker| message.contains(marker)) {
                    RenderError::PageLoadTimeout(context.to_string())
                } else {
                    RenderError::Browser(message)
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Serialization(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RenderError::Browser(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_page_lost() {
        let err = RenderError::Browser("Execution context was detached".to_string());
        assert!(matches!(err.classify("a.html"), RenderError::PageLost(_)));

        let err = RenderError::Browser("Target closed".to_string());
        assert!(matches!(err.classify("a.html"), RenderError::PageLost(_)));

        let err = RenderError::Browser("browser has closed the connection".to_string());
        assert!(matches!(err.classify("a.html"), RenderError::PageLost(_)));
    }

    #[test]
    fn test_classify_timeout() {
        let err = RenderError::Browser("Navigation Timeout exceeded".to_string());
        assert_eq!(
            err.classify("/tmp/a.html"),
            RenderError::PageLoadTimeout("/tmp/a.html".to_string())
        );
    }

    #[test]
    fn test_classify_passthrough() {
        let err = RenderError::Browser("net::ERR_FAILED".to_string());
        assert_eq!(
            err.classify("x"),
            RenderError::Browser("net::ERR_FAILED".to_string())
        );

        let err = RenderError::FileNotFound("closed.html".to_string());
        assert_eq!(
            err.classify("x"),
            RenderError::FileNotFound("closed.html".to_string())
        );
    }

    #[test]
    fn test_retryable_and_taint() {
        assert!(RenderError::PageLost("detached".to_string()).is_retryable());
        assert!(!RenderError::TaskTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!RenderError::EngineClosed.is_retryable());

        assert!(!RenderError::FileNotFound("a".to_string()).taints_page());
        assert!(!RenderError::InvalidPath("".to_string()).taints_page());
        assert!(RenderError::TaskTimeout(Duration::from_secs(1)).taints_page());
        assert!(RenderError::TargetElementNotFound("#x".to_string()).taints_page());
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            RenderError::FileNotFound("a".to_string()).severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            RenderError::PageLost("a".to_string()).severity(),
            ErrorSeverity::Medium
        );
        assert_eq!(
            RenderError::BrowserLaunchFailed("a".to_string()).severity(),
            ErrorSeverity::Critical
        );
    }
}
