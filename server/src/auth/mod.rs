//! Device authentication.

mod middleware;

pub use middleware::AuthDevice;
