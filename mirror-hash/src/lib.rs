pub mod errors;
pub mod hash;

pub use errors::{HashError, Result};
pub use hash::{hash_bytes, hash_file, hash_reader, ContentHash};
