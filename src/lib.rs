#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod api;
pub mod camera;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod session;

pub use error::{OurError, OurResult};
