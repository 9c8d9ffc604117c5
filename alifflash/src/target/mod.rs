//! Target boards and the flashing pipeline that drives them.

pub mod board;
pub mod ensemble;

pub use board::{Board, MramLayout, SYSTEM_MRAM_BASE};
