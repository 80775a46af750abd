/*!
 * Error types for Taskguard
 */

use std::io;
use taskguard_core_dead_letter::DeadLetterError;
use taskguard_core_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskguardError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_NOT_FOUND: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum TaskguardError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Config file is not valid TOML for the expected shape
    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config could not be rendered as TOML
    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Failure from a resilience primitive
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// Failure from the dead-letter store
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}
