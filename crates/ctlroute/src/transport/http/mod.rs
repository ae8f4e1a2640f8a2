//! HTTP health endpoint via axum.

mod routes;
mod server;

pub use routes::routes;
pub use server::{serve, serve_listener};
