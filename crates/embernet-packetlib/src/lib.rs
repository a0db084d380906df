#![forbid(unsafe_code)]

//! Wire-format parsing and building for the embernet stack.
//!
//! Every format follows the same shape: a borrowing parse struct with
//! accessor methods, and a builder struct with `len()` / `write()` /
//! `build_vec()`. Parsers never panic on wire input; anything short or
//! inconsistent comes back as a [`PacketError`].

pub mod packet;
pub mod util;

pub use packet::PacketError;
