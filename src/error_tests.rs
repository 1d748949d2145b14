//! Tests for queue error types.

use super::*;

// ============================================================================
// Transience Classification Tests
// ============================================================================

mod transience {
    use super::*;

    /// Verify transient backend errors are classified as retryable.
    #[test]
    fn test_transient_backend_error() {
        let err = QueueError::transient("redis", "connection reset");
        assert!(err.is_transient());
    }

    /// Verify permanent backend errors are not classified as retryable.
    #[test]
    fn test_permanent_backend_error() {
        let err = QueueError::permanent("amqp", "channel closed by broker");
        assert!(!err.is_transient());
    }

    /// Verify connection failures end a loop rather than being absorbed.
    #[test]
    fn test_connection_failed_is_not_transient() {
        let err = QueueError::ConnectionFailed {
            message: "broker unreachable".to_string(),
        };
        assert!(!err.is_transient());
    }

    /// Verify decode and validation errors are never retryable.
    #[test]
    fn test_permanent_error_categories() {
        let decode = QueueError::Decode(DecodeError::InvalidUtf8);
        assert!(!decode.is_transient());

        let validation = QueueError::Validation(ValidationError::Required {
            field: "queue_name".to_string(),
        });
        assert!(!validation.is_transient());

        let configuration = QueueError::Configuration(ConfigurationError::Missing {
            key: "kafka.brokers".to_string(),
        });
        assert!(!configuration.is_transient());
    }
}

// ============================================================================
// Capability Discrimination Tests
// ============================================================================

mod capability {
    use super::*;

    /// Verify an absent capability is discriminable from a failure.
    #[test]
    fn test_not_supported_discrimination() {
        let err = QueueError::NotSupported {
            operation: "length",
            backend: "kafka",
        };
        assert!(err.is_not_supported());
        assert!(!err.is_transient());
    }

    /// Verify ordinary failures never report as absent capabilities.
    #[test]
    fn test_failures_are_not_capability_absence() {
        let err = QueueError::transient("sqs", "throttled");
        assert!(!err.is_not_supported());

        let err = QueueError::HandleNotFound {
            receipt: "abc".to_string(),
        };
        assert!(!err.is_not_supported());
    }
}

// ============================================================================
// Display Formatting Tests
// ============================================================================

mod display {
    use super::*;

    /// Verify error messages carry the backend and operation context.
    #[test]
    fn test_not_supported_message() {
        let err = QueueError::NotSupported {
            operation: "delete_queue",
            backend: "kafka",
        };
        let text = err.to_string();
        assert!(text.contains("delete_queue"));
        assert!(text.contains("kafka"));
    }

    /// Verify backend errors include the originating backend name.
    #[test]
    fn test_backend_error_message() {
        let err = QueueError::permanent("amqp", "nacked");
        let text = err.to_string();
        assert!(text.contains("amqp"));
        assert!(text.contains("nacked"));
    }

    /// Verify nested errors surface through the From conversions.
    #[test]
    fn test_error_conversion_chain() {
        let validation = ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: "bad characters".to_string(),
        };
        let err: QueueError = validation.into();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(err.to_string().contains("queue_name"));
    }
}
