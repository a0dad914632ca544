//! Request handlers.

mod entities;
mod mutations;
mod sessions;

pub use entities::*;
pub use mutations::*;
pub use sessions::*;
