use super::*;

#[test]
fn test_retryable_classification() {
    assert!(EngineError::Broker("connection reset".into()).is_retryable());
    assert!(EngineError::Unavailable("no eligible node".into()).is_retryable());
    assert!(EngineError::Timeout("publish".into()).is_retryable());
    assert!(!EngineError::Validation("bad input".into()).is_retryable());
    assert!(!EngineError::TaskNotFound { id: "t1".into() }.is_retryable());
}

#[test]
fn test_fatal_classification() {
    assert!(EngineError::Internal("boom".into()).is_fatal());
    assert!(EngineError::Configuration("missing section".into()).is_fatal());
    assert!(!EngineError::Broker("slow".into()).is_fatal());
}

#[test]
fn test_not_found_classification() {
    assert!(EngineError::JobNotFound { id: "j1".into() }.is_not_found());
    assert!(EngineError::NextTaskNotFound {
        parent_id: "p1".into()
    }
    .is_not_found());
    assert!(!EngineError::Cancelled.is_not_found());
}

#[test]
fn test_serde_json_error_conversion() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let engine_err: EngineError = err.into();
    assert!(matches!(engine_err, EngineError::Serialization(_)));
}

#[test]
fn test_display_carries_exit_code() {
    let err = EngineError::NonZeroExit {
        code: 127,
        output: "sh: not found".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("127"));
    assert!(msg.contains("sh: not found"));
}
