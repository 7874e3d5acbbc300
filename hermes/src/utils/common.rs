use chrono::Utc;

pub type OrError<T> = Result<T, String>;

/// Creates standardized Hermes error message
#[macro_export]
macro_rules! hermes_error {
    ($component:expr, $method:expr, $msg:expr) => {
        format!("Hermes {} Error: {}", concat!($component, "::", $method), $msg)
    };
}

/// Creates error with cause chain
#[macro_export]
macro_rules! hermes_error_cause {
    ($component:expr, $method:expr, $msg:expr, $cause:expr) => {
        format!(
            "Hermes {} Error: {}\nCaused by: {}",
            concat!($component, "::", $method),
            $msg,
            $cause
        )
    };
}

/// Milliseconds since the Unix epoch, the `ts` unit on the wire.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Splits a comma-separated topic list, trimming entries and dropping empty ones.
pub fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
