//! # estafette-shared
//!
//! Identifiers, protocol constants and the symmetric encryption service
//! shared between the store and the delivery engine.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::CryptoError;
