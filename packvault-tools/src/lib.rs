//! Common helpers used throughout packvault.
//!
//! Nothing in here knows about repositories, packs or indexes; the crates
//! building on top pull in what they need.

pub mod backoff;
pub mod cancel;
pub mod fs;
pub mod lru_cache;
pub mod time;

pub use cancel::Cancel;
pub use lru_cache::{Cacher, LruCache};
