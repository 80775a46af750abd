/*!
 * Taskguard - resilience toolkit for services that call flaky dependencies
 *
 * The primitives live in two library crates and are re-exported here:
 * - `taskguard-core-resilience`: resource pool, retry executor, rate limiter,
 *   bounded dispatch with timeouts, circuit breaker
 * - `taskguard-core-dead-letter`: SQLite store for permanently failed tasks
 *
 * This crate adds the TOML configuration, logging setup, the [`Toolkit`]
 * that wires everything together, and the `taskguard` CLI.
 */

pub mod cli_style;
pub mod config;
pub mod error;
pub mod logging;
pub mod toolkit;

pub use config::{LogLevel, ToolkitConfig};
pub use error::{Result, TaskguardError};
pub use toolkit::Toolkit;

pub use taskguard_core_dead_letter as dead_letter;
pub use taskguard_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
