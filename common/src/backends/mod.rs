//! Built-in storage backends.

pub mod local;
pub mod memory;
