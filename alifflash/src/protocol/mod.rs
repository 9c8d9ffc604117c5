//! Protocol implementations.

pub mod isp;

// Re-export common types
pub use isp::{CommandId, IspFrame, Response, checksum, decode, encode, parse_frame};
