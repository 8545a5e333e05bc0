//! gridrelay - four-party UDP video relay
//!
//! This crate provides the session and routing core of a relay that feeds
//! up to four client video streams into a grid compositor and sends the
//! composited stream back to every client.

pub mod config;
pub mod error;
pub mod relay;
pub mod utils;

pub use error::{RelayError, Result};
