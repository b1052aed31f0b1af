//! Common types shared across SecureCall components.

#![warn(clippy::pedantic)]

/// Module for call identifiers and roles
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
