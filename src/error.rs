use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid capture options: {}", .0.join("; "))]
    InvalidOptions(Vec<String>),

    #[error("URL \"{0}\" is not allowed")]
    NotAllowed(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Error while sending image file: {0}")]
    SendFailed(String),

    #[error("Error while detecting image file size: {0}")]
    SizeDetectionFailed(String),

    #[error("Error while reading image file: {0}")]
    ReadFailed(String),

    #[error("Error while streaming image file: {0}")]
    UploadFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl CaptureError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CaptureError::InvalidOptions(_) => ErrorClass::Validation,
            CaptureError::NotAllowed(_) => ErrorClass::Authorization,
            CaptureError::BrowserLaunchFailed(_)
            | CaptureError::PageError(_)
            | CaptureError::RenderFailed(_)
            | CaptureError::Timeout(_) => ErrorClass::Capture,
            CaptureError::SendFailed(_)
            | CaptureError::SizeDetectionFailed(_)
            | CaptureError::ReadFailed(_)
            | CaptureError::UploadFailed(_) => ErrorClass::Delivery,
            CaptureError::ConfigurationError(_)
            | CaptureError::IoError(_)
            | CaptureError::SerializationError(_)
            | CaptureError::SemaphoreError(_) => ErrorClass::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::InvalidOptions(_) => ErrorSeverity::Low,
            CaptureError::NotAllowed(_) => ErrorSeverity::Low,
            CaptureError::ConfigurationError(_) => ErrorSeverity::High,
            CaptureError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Authorization,
    Capture,
    Delivery,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Capture => "capture",
            ErrorClass::Delivery => "delivery",
            ErrorClass::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for CaptureError {
    fn from(err: AcquireError) -> Self {
        CaptureError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            CaptureError::InvalidOptions(vec!["url is required".into()]).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            CaptureError::NotAllowed("http://other.com".into()).class(),
            ErrorClass::Authorization
        );
        assert_eq!(
            CaptureError::Timeout(Duration::from_secs(30)).class(),
            ErrorClass::Capture
        );
        assert_eq!(
            CaptureError::ReadFailed("broken pipe".into()).class(),
            ErrorClass::Delivery
        );
        assert_eq!(
            CaptureError::IoError("disk full".into()).class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn test_not_allowed_message() {
        let err = CaptureError::NotAllowed("http://other.com/page".into());
        assert_eq!(err.to_string(), "URL \"http://other.com/page\" is not allowed");
    }

    #[test]
    fn test_delivery_message_templates() {
        assert_eq!(
            CaptureError::SendFailed("permission denied".into()).to_string(),
            "Error while sending image file: permission denied"
        );
        assert_eq!(
            CaptureError::SizeDetectionFailed("no such file".into()).to_string(),
            "Error while detecting image file size: no such file"
        );
        assert_eq!(
            CaptureError::ReadFailed("unexpected eof".into()).to_string(),
            "Error while reading image file: unexpected eof"
        );
        assert_eq!(
            CaptureError::UploadFailed("connection refused".into()).to_string(),
            "Error while streaming image file: connection refused"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CaptureError = io_err.into();
        assert!(matches!(err, CaptureError::IoError(_)));
    }
}
