pub mod id;
pub mod lru;

pub use lru::LruCache;
