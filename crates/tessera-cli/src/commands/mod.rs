//! CLI command implementations.

pub mod backends;
pub mod cancel;
pub mod common;
pub mod list;
pub mod script;
pub mod status;
pub mod submit;
pub mod wait;
