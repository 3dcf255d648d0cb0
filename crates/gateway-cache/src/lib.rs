pub mod entry;
pub mod key;
pub mod policy;
pub mod store;

pub use entry::CachedEntry;
pub use key::{CacheKey, ResourceRequest};
pub use policy::{CacheMode, CachePolicy, Freshness};
pub use store::{CacheStats, CacheStore, MemoryStore};
