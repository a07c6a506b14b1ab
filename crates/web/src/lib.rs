//! Custom Installer Builder web service
//!
//! HTTP API over the build session, partition and packaging operations.

pub mod server;

pub use server::{ApiError, WebServer, SESSION_COOKIE};
