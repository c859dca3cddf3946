//! Configuration management module

pub mod env;
pub mod parser;
pub mod validation;

// Re-export main functionality
pub use env::EnvManager;
pub use parser::{display_config_summary, display_server_summary, load_config, load_server_config, ConfigParser};
pub use validation::{validate_config, ConfigValidator, ValidationLevel, ValidationWarning};

// Re-export from models for convenience
pub use crate::models::{ServerConfig, TestConfig};

// Additional comprehensive tests in separate module
#[cfg(test)]
mod comprehensive_tests;
