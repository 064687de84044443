//! The runnable daemon: reactor + protocol service + control handle.
#![allow(clippy::type_complexity)]
mod controller;
pub use controller::*;
mod error;
pub use error::Error;

pub mod handle;
mod service;
pub(crate) mod stream;
