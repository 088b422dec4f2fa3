//! Shared utility modules used across Quire components.

pub mod bits;
pub mod varint;
