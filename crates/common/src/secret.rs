//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. `SecretString` implements `Debug`
//! with redaction, so a struct deriving `Debug` that holds one stays safe to
//! log through `{:?}` or tracing fields. Values are zeroized on drop.
//!
//! In SecureCall this covers TURN relay credentials and any bearer material
//! handed to the verification endpoint.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnCredential {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let turn = TurnCredential {
//!     username: "relay-user".to_string(),
//!     credential: SecretString::from("s3cr3t"),
//! };
//!
//! assert!(!format!("{turn:?}").contains("s3cr3t"));
//! assert_eq!(turn.credential.expose_secret(), "s3cr3t");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
