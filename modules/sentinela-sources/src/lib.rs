pub mod client;
pub mod error;
pub mod http;
pub mod normalize;
pub mod proxy_pool;
pub mod services;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{RawRecord, SourceClient};
pub use error::{FetchError, Result};
pub use http::{HttpFetcher, ReqwestFetcher};
pub use normalize::{normalize_batch, NormalizeReport, Normalized};
pub use proxy_pool::{ProxyPool, ProxyPoolSettings, ProxyPoolStatus};
pub use services::civil_defense::{CivilDefenseClient, EmergencyFeature};
pub use services::fire::{FireClient, FireRow};
pub use services::seismic::{SeismicClient, SeismicEvent};
