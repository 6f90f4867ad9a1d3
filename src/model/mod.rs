//! Core data model types for instadb

mod digest;
mod key;

pub use digest::{Digest, DIGEST_HEX_LEN};
pub use key::{Key, KeyHash};
