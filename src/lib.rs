pub mod backoff;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod landing;
pub mod monitoring;
pub mod pool;
pub mod rate_limit;
pub mod rewrite;
pub mod router;
pub mod sessions;
pub mod sub_cache;
pub mod subscription;
pub mod transport;

pub use config::Settings;
pub use error::ProxyError;
pub use router::Gateway;
