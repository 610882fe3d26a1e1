//! fsmirror workspace root
//!
//! Re-exports the member crates and hosts the integration tests that drive
//! them together.

pub use mirror_hash as hash;
pub use mirror_index as index;
