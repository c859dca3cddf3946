//! Error handling for the speed test engine

use thiserror::Error;

/// Error types shared by the engine, the transports and the server primitives
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection refused, reset or dropped mid-stream
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP request errors (non-success status, malformed response)
    #[error("HTTP request error: {0}")]
    HttpRequest(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Unexpected or malformed duplex control message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors (sockets, files)
    #[error("I/O error: {0}")]
    Io(String),

    /// Parsing errors (URLs, JSON, numbers)
    #[error("Parsing error: {0}")]
    Parse(String),

    /// A measurement phase produced no usable samples
    #[error("Phase exhausted: {0}")]
    PhaseExhausted(String),

    /// Cooperative cancellation of a running test
    #[error("Test aborted")]
    Aborted,

    /// Server startup or handler errors
    #[error("Server error: {0}")]
    Server(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new HTTP request error
    pub fn http_request<S: Into<String>>(message: S) -> Self {
        Self::HttpRequest(message.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }

    /// Create a new parsing error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }

    /// Create a new phase exhausted error
    pub fn phase_exhausted<S: Into<String>>(message: S) -> Self {
        Self::PhaseExhausted(message.into())
    }

    /// Create a new server error
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::Server(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Get error category for logging and reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Transport(_) => "TRANSPORT",
            Self::HttpRequest(_) => "HTTP",
            Self::Timeout(_) => "TIMEOUT",
            Self::Protocol(_) => "PROTOCOL",
            Self::Validation(_) => "VALIDATION",
            Self::Io(_) => "IO",
            Self::Parse(_) => "PARSE",
            Self::PhaseExhausted(_) => "PHASE",
            Self::Aborted => "ABORTED",
            Self::Server(_) => "SERVER",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a failed sample with this error can be skipped and the phase continued
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::HttpRequest(_) | Self::Timeout(_) | Self::PhaseExhausted(_) => true,
            Self::Protocol(_) | Self::Io(_) => true,
            Self::Config(_) | Self::Validation(_) | Self::Parse(_) | Self::Aborted => false,
            Self::Server(_) | Self::Internal(_) => false,
        }
    }

    /// True for the cancellation signal, which is never reported as a failure
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Get user-friendly error message with suggestions
    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::Config(msg) => {
                format!("Configuration problem: {}\n\nSuggestion: Check your .env file, SPEEDTEST_* variables or command line arguments.", msg)
            }
            Self::Transport(msg) => {
                format!("Could not reach the speed test server: {}\n\nSuggestion: Check that the server is running and the URL is correct.", msg)
            }
            Self::HttpRequest(msg) => {
                format!("HTTP request failed: {}\n\nSuggestion: The server may not implement the /ping, /download and /upload endpoints.", msg)
            }
            Self::Timeout(msg) => {
                format!("Request timed out: {}\n\nSuggestion: Increase --timeout or check your network connection.", msg)
            }
            Self::Protocol(msg) => {
                format!("Unexpected message from server: {}\n\nSuggestion: The server may run an incompatible version. Try --transport streaming.", msg)
            }
            Self::Validation(msg) => {
                format!("Invalid input: {}\n\nSuggestion: Check the values passed for duration, connections and grace period.", msg)
            }
            Self::Io(msg) => {
                format!("I/O operation failed: {}\n\nSuggestion: Check file permissions and that the bind address is free.", msg)
            }
            Self::Parse(msg) => {
                format!("Failed to parse data: {}\n\nSuggestion: Check the format of your input data or configuration files.", msg)
            }
            Self::PhaseExhausted(msg) => {
                format!("A measurement produced no samples: {}\n\nSuggestion: The network may be saturated or dropping traffic. Try running the test again.", msg)
            }
            Self::Aborted => "The test was aborted before it completed.".to_string(),
            Self::Server(msg) => {
                format!("Server failure: {}\n\nSuggestion: Check the server logs for details.", msg)
            }
            Self::Internal(msg) => {
                format!("Internal error: {}\n\nThis is likely a bug. Please report this issue with the error details.", msg)
            }
        }
    }

    /// Get exit code for this error type
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Validation(_) | Self::Parse(_) => 1,
            Self::Transport(_) | Self::HttpRequest(_) | Self::Protocol(_) => 2,
            Self::Timeout(_) => 3,
            Self::Io(_) | Self::Server(_) => 5,
            Self::PhaseExhausted(_) => 6,
            Self::Aborted => 130,
            Self::Internal(_) => 99,
        }
    }

    /// Format error for console display with color coding
    pub fn format_for_console(&self, use_color: bool) -> String {
        let category = self.category();
        let message = self.to_string();

        if use_color {
            use colored::Colorize;
            match self {
                Self::Config(_) | Self::Validation(_) | Self::Parse(_) => {
                    format!("[{}] {}", category.red().bold(), message.red())
                }
                Self::Transport(_) | Self::HttpRequest(_) | Self::Protocol(_) => {
                    format!("[{}] {}", category.yellow().bold(), message.yellow())
                }
                Self::Timeout(_) => {
                    format!("[{}] {}", category.blue().bold(), message.blue())
                }
                Self::Aborted => {
                    format!("[{}] {}", category.magenta().bold(), message.magenta())
                }
                Self::Io(_) | Self::Server(_) | Self::PhaseExhausted(_) => {
                    format!("[{}] {}", category.cyan().bold(), message.cyan())
                }
                Self::Internal(_) => {
                    format!("[{}] {}", category.bright_red().bold(), message.bright_red())
                }
            }
        } else {
            format!("[{}] {}", category, message)
        }
    }

    /// Prefix the message with context while keeping the category
    fn with_prefix(self, context: &str) -> Self {
        let join = |msg: String| format!("{}: {}", context, msg);
        match self {
            Self::Config(m) => Self::Config(join(m)),
            Self::Transport(m) => Self::Transport(join(m)),
            Self::HttpRequest(m) => Self::HttpRequest(join(m)),
            Self::Timeout(m) => Self::Timeout(join(m)),
            Self::Protocol(m) => Self::Protocol(join(m)),
            Self::Validation(m) => Self::Validation(join(m)),
            Self::Io(m) => Self::Io(join(m)),
            Self::Parse(m) => Self::Parse(join(m)),
            Self::PhaseExhausted(m) => Self::PhaseExhausted(join(m)),
            Self::Aborted => Self::Aborted,
            Self::Server(m) => Self::Server(join(m)),
            Self::Internal(m) => Self::Internal(join(m)),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::transport(error.to_string()),
            std::io::ErrorKind::TimedOut => Self::timeout(error.to_string()),
            _ => Self::io(error.to_string()),
        }
    }
}

impl From<url::ParseError> for AppError {
    fn from(error: url::ParseError) -> Self {
        Self::parse(format!("URL parse error: {}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout(error.to_string())
        } else if error.is_connect() || error.is_request() || error.is_body() {
            Self::transport(error.to_string())
        } else {
            Self::http_request(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match error {
            WsError::Io(io) => io.into(),
            WsError::Url(e) => Self::config(format!("Invalid duplex URL: {}", e)),
            WsError::Protocol(e) => Self::protocol(e.to_string()),
            other => Self::transport(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation deadline elapsed")
    }
}

impl From<dotenv::Error> for AppError {
    fn from(error: dotenv::Error) -> Self {
        Self::config(format!("Environment file error: {}", error))
    }
}

impl From<std::num::ParseIntError> for AppError {
    fn from(error: std::num::ParseIntError) -> Self {
        Self::parse(format!("Integer parse error: {}", error))
    }
}

impl From<std::num::ParseFloatError> for AppError {
    fn from(error: std::num::ParseFloatError) -> Self {
        Self::parse(format!("Float parse error: {}", error))
    }
}

impl From<std::str::ParseBoolError> for AppError {
    fn from(error: std::str::ParseBoolError) -> Self {
        Self::parse(format!("Boolean parse error: {}", error))
    }
}

impl From<std::net::AddrParseError> for AppError {
    fn from(error: std::net::AddrParseError) -> Self {
        Self::parse(format!("Socket address parse error: {}", error))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string())
    }
}

/// Custom Result type for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Error context trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to an error
    fn context(self, message: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<AppError>,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_prefix(&f()))
    }

    fn context(self, message: &'static str) -> Result<T> {
        self.with_context(|| message.to_string())
    }
}
