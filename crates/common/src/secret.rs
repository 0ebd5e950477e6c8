//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for connection strings and
//! credentials. `SecretString` implements `Debug` with redaction, so a
//! config struct that derives or hand-writes `Debug` never leaks the value
//! through `{:?}` or tracing fields.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let database_url = SecretString::from("postgres://app:pw@db/portal");
//! assert!(!format!("{database_url:?}").contains("pw@db"));
//!
//! let url: &str = database_url.expose_secret();
//! assert!(url.starts_with("postgres://"));
//! ```
//!
//! Use `SecretString` for database URLs (they embed passwords) and any
//! token-like configuration value.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};
