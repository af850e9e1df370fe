//! Retry classification and backoff for target attempts.

use std::time::Duration;

/// Error-message fragments that mark a failure as transient. Matching is
/// case-insensitive on the rendered message, which keeps the classifier
/// working across reqwest, the OS and remote registry phrasings.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "deadline exceeded",
    "i/o timeout",
    "connection reset",
    "connection refused",
    "temporary",
    "tls handshake timeout",
    "unexpected eof",
    "eof",
    "dial tcp",
];

/// Does the message describe a transient failure worth another attempt?
pub fn is_retryable(message: &str) -> bool {
    let m = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| m.contains(p))
}

/// Does the message describe a cancellation? Whether that cancellation
/// terminates the target or merely retries depends on who fired it: the
/// worker cross-checks the task token before deciding.
pub fn is_cancellation(message: &str) -> bool {
    message.to_lowercase().contains("cancel")
}

/// Exponential backoff between attempts: `min(500ms * 2^attempt, 5s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(500);
    let capped = base.saturating_mul(1u32 << attempt.min(16));
    capped.min(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_patterns() {
        assert!(is_retryable("i/o timeout"));
        assert!(is_retryable("read: Connection Reset by peer"));
        assert!(is_retryable("context deadline exceeded"));
        assert!(is_retryable("unexpected EOF while reading body"));
        assert!(is_retryable("dial tcp 10.0.0.1:443: connect: connection refused"));
        assert!(is_retryable("TLS handshake timeout"));
    }

    #[test]
    fn test_non_retryable_messages() {
        assert!(!is_retryable("unauthorized"));
        assert!(!is_retryable("manifest unknown"));
        assert!(!is_retryable("blob digest mismatch"));
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(is_cancellation("canceled"));
        assert!(is_cancellation("context cancelled"));
        assert!(!is_cancellation("context deadline exceeded"));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(5));
        assert_eq!(backoff_delay(30), Duration::from_secs(5));
    }
}
