#![doc = include_str!("../README.md")]

mod bits;
mod error;

pub mod framing;
pub mod spacepacket;

pub use error::{Error, Result};
