//! Core types shared across layers

mod address;
pub mod pipe;
mod stream;

pub use address::Address;
pub use stream::{IntoStream, Stream};

pub use crate::error::Result;
