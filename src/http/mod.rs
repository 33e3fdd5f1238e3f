//! HTTP admission layer.

mod middleware;
mod server;

pub use middleware::{admit, Admission, RATE_LIMITED_MESSAGE};
pub use server::HttpServer;
