//! Logging infrastructure and log sanitization.
//!
//! A small stderr logger plus the sanitizers every log entry and audit
//! record passes through: control characters are stripped, strings are
//! capped at 200 characters, and JSON values are capped at depth 5 and 50
//! keys per object. Sanitization is not optional: the only write path is
//! [`Logger::emit`], which sanitizes before anything reaches stderr.

use std::env;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Maximum length of any sanitized string.
pub const MAX_LOG_STRING: usize = 200;

/// Maximum nesting depth of any sanitized JSON value.
pub const MAX_LOG_DEPTH: usize = 5;

/// Maximum number of keys retained per sanitized JSON object.
pub const MAX_LOG_KEYS: usize = 50;

/// How much the daemon says on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Nothing at all.
    Quiet,
    /// Errors and warnings.
    Normal,
    /// Everything, including per-operation debug chatter.
    Verbose,
}

impl LogLevel {
    /// The lowest severity this level lets through, if any.
    fn floor(self) -> Option<Severity> {
        match self {
            Self::Quiet => None,
            Self::Normal => Some(Severity::Warn),
            Self::Verbose => Some(Severity::Debug),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quiet => "quiet",
            Self::Normal => "normal",
            Self::Verbose => "verbose",
        })
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quiet" => Ok(Self::Quiet),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            other => Err(format!("unrecognized log mode '{other}'")),
        }
    }
}

/// Severity of one message. Ordered from chattiest to most urgent so a
/// level's floor is a simple comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// A stderr logger.
///
/// All four severity methods funnel through one gate, so sanitization and
/// level filtering cannot drift apart.
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    /// Creates a logger at `level`.
    #[must_use]
    pub const fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// The configured level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Logs an error (suppressed only at Quiet).
    pub fn error(&self, message: &str) {
        self.emit(Severity::Error, message);
    }

    /// Logs a warning (suppressed only at Quiet).
    pub fn warn(&self, message: &str) {
        self.emit(Severity::Warn, message);
    }

    /// Logs an informational message (Verbose only).
    pub fn info(&self, message: &str) {
        self.emit(Severity::Info, message);
    }

    /// Logs a debug message (Verbose only).
    pub fn debug(&self, message: &str) {
        self.emit(Severity::Debug, message);
    }

    /// The single write path: gate on the level's floor, sanitize, print.
    fn emit(&self, severity: Severity, message: &str) {
        let admitted = self.level.floor().is_some_and(|floor| severity >= floor);
        if admitted {
            eprintln!("{}: {}", severity.tag(), sanitize_message(message));
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Normal)
    }
}

/// Builds a logger from CLI-style flags and `PORTREEVE_LOG_MODE`.
///
/// Flags win over the environment, `verbose` wins over `quiet`, and an
/// unparseable mode falls back to Normal.
#[must_use]
pub fn init_logger(verbose: bool, quiet: bool) -> Logger {
    let level = match (verbose, quiet) {
        (true, _) => LogLevel::Verbose,
        (false, true) => LogLevel::Quiet,
        (false, false) => env::var("PORTREEVE_LOG_MODE")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(LogLevel::Normal),
    };
    Logger::new(level)
}

/// Strips control characters and caps the string at [`MAX_LOG_STRING`]
/// characters.
///
/// # Examples
///
/// ```
/// use portreeve::logging::sanitize_message;
///
/// assert_eq!(sanitize_message("ok\x1b[31m"), "ok[31m");
/// assert_eq!(sanitize_message("a\nb"), "ab");
/// ```
#[must_use]
pub fn sanitize_message(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_LOG_STRING)
        .collect()
}

/// Sanitizes an arbitrary JSON value for logging or auditing.
///
/// Strings are passed through [`sanitize_message`]; objects keep at most
/// [`MAX_LOG_KEYS`] keys; anything deeper than [`MAX_LOG_DEPTH`] levels is
/// replaced by a `"…"` marker.
#[must_use]
pub fn sanitize_value(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_LOG_DEPTH {
        return Value::String("…".to_string());
    }
    match value {
        Value::String(s) => Value::String(sanitize_message(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_at_depth(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map.iter().take(MAX_LOG_KEYS) {
                out.insert(sanitize_message(key), sanitize_at_depth(item, depth + 1));
            }
            out.into()
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn test_log_level_ordering_and_parse() {
        assert!(LogLevel::Quiet < LogLevel::Normal);
        assert!(LogLevel::Normal < LogLevel::Verbose);
        assert_eq!("QUIET".parse::<LogLevel>().unwrap(), LogLevel::Quiet);
        assert_eq!("verbose".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_floors() {
        assert_eq!(LogLevel::Quiet.floor(), None);
        assert_eq!(LogLevel::Normal.floor(), Some(Severity::Warn));
        assert_eq!(LogLevel::Verbose.floor(), Some(Severity::Debug));
    }

    #[test]
    fn test_severity_admission() {
        // Normal admits warnings and errors but not info or debug.
        let floor = LogLevel::Normal.floor().unwrap();
        assert!(Severity::Error >= floor);
        assert!(Severity::Warn >= floor);
        assert!(Severity::Info < floor);
        assert!(Severity::Debug < floor);

        // Verbose admits everything.
        let floor = LogLevel::Verbose.floor().unwrap();
        assert!(Severity::Debug >= floor);
    }

    #[test]
    #[serial]
    fn test_init_logger_precedence() {
        let saved = env::var("PORTREEVE_LOG_MODE").ok();
        env::remove_var("PORTREEVE_LOG_MODE");

        assert_eq!(init_logger(false, false).level(), LogLevel::Normal);
        assert_eq!(init_logger(true, false).level(), LogLevel::Verbose);
        assert_eq!(init_logger(false, true).level(), LogLevel::Quiet);
        assert_eq!(init_logger(true, true).level(), LogLevel::Verbose);

        env::set_var("PORTREEVE_LOG_MODE", "quiet");
        assert_eq!(init_logger(false, false).level(), LogLevel::Quiet);
        // Flags still win over the environment.
        assert_eq!(init_logger(true, false).level(), LogLevel::Verbose);

        env::set_var("PORTREEVE_LOG_MODE", "bogus");
        assert_eq!(init_logger(false, false).level(), LogLevel::Normal);

        match saved {
            Some(val) => env::set_var("PORTREEVE_LOG_MODE", val),
            None => env::remove_var("PORTREEVE_LOG_MODE"),
        }
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize_message("a\x00b\x1bc\r\nd"), "abcd");
        assert_eq!(sanitize_message("plain"), "plain");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_message(&long).len(), MAX_LOG_STRING);
    }

    #[test]
    fn test_sanitize_value_depth_cap() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": 1}}}}}});
        let sanitized = sanitize_value(&deep);
        let leaf = &sanitized["a"]["b"]["c"]["d"]["e"];
        assert_eq!(leaf, &Value::String("…".to_string()));
    }

    #[test]
    fn test_sanitize_value_key_cap() {
        let mut map = serde_json::Map::new();
        for i in 0..80 {
            map.insert(format!("key{i}"), json!(i));
        }
        let sanitized = sanitize_value(&Value::Object(map));
        assert_eq!(sanitized.as_object().unwrap().len(), MAX_LOG_KEYS);
    }

    #[test]
    fn test_sanitize_value_strings_inside() {
        let value = json!({"cmd": "run\x07me", "n": 3});
        let sanitized = sanitize_value(&value);
        assert_eq!(sanitized["cmd"], "runme");
        assert_eq!(sanitized["n"], 3);
    }
}
