//! Unit tests for `AppError` display prefixes and retry classification.

use stay_concierge::AppError;

#[test]
fn display_carries_kind_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("locked".into()), "db: locked"),
        (AppError::Oracle("500".into()), "oracle: 500"),
        (AppError::Transport("refused".into()), "transport: refused"),
        (AppError::Timeout("send exceeded 15s".into()), "timeout: send exceeded 15s"),
        (
            AppError::InvalidTransition("completed -> in_progress".into()),
            "invalid transition: completed -> in_progress",
        ),
        (AppError::NotFound("task 1".into()), "not found: task 1"),
        (AppError::Duplicate("open task".into()), "duplicate: open task"),
        (AppError::Conflict("task moved".into()), "conflict: task moved"),
        (AppError::InvalidInput("blank".into()), "invalid input: blank"),
        (AppError::Unauthorized("token".into()), "unauthorized: token"),
        (AppError::Ipc("pipe".into()), "ipc: pipe"),
        (AppError::Http("bind".into()), "http: bind"),
        (AppError::Io("disk".into()), "io: disk"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn messages_have_no_trailing_period() {
    let s = AppError::Transport("write failed".into()).to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn only_collaborator_failures_are_retryable() {
    assert!(AppError::Oracle("x".into()).is_retryable());
    assert!(AppError::Transport("x".into()).is_retryable());
    assert!(AppError::Timeout("x".into()).is_retryable());

    assert!(!AppError::Db("x".into()).is_retryable());
    assert!(!AppError::InvalidTransition("x".into()).is_retryable());
    assert!(!AppError::Duplicate("x".into()).is_retryable());
    assert!(!AppError::NotFound("x".into()).is_retryable());
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("not = [valid")
        .map(|_| ())
        .map_err(AppError::from)
        .expect_err("invalid toml");
    assert!(err.to_string().starts_with("config: invalid config:"));
}

#[test]
fn implements_std_error() {
    fn takes_error(_: &dyn std::error::Error) {}
    takes_error(&AppError::Io("test".into()));
}
