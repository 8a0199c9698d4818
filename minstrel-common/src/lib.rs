//! Minstrel Common Library
//!
//! Shared protocol constants and wire formats for the Minstrel voice path.

pub mod session;
pub mod voice;
