//! Secondary transports for ctlroute.
//!
//! The control channel itself lives in `bridge` and `server`. This module
//! provides the HTTP health endpoint via axum.

pub mod http;

pub use http::serve;
