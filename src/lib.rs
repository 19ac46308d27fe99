pub mod cache;
pub mod cache_control;
pub mod clock;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod settings;
pub mod types;

pub use crate::cache::{
    CacheType, CachedLookup, PurgeStats, ResponseCache, StoreOutcome, Variation,
};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::middleware::{CacheMiddleware, HttpSend};
pub use crate::settings::Settings;
pub use crate::types::{Body, CACHE_TYPE_OPTION, Request, RequestOptions, Response};
