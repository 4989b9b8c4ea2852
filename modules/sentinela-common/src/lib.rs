pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod time;
pub mod types;

pub use cache::{ExpiringCache, SingleFlight};
pub use config::Config;
pub use error::SentinelaError;
pub use geo::{is_valid_coord, Coordinates};
pub use types::*;
