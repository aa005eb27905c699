//! Shared types

pub mod import;
pub mod messages;
pub mod session;

pub use import::*;
pub use messages::*;
pub use session::*;
