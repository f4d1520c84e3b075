pub mod cache;

pub use cache::{CacheStore, DEFAULT_CACHE_PATH, DEFAULT_TTL};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
