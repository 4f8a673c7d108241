pub mod admission;
pub mod config;
pub mod greylist;
pub mod rate;
pub mod store;

pub use admission::{AdmissionControl, ConnectionPermit, PolicyReject};
pub use config::{GreylistConfig, PolicyConfig, RateConfig};
pub use greylist::{Greylist, GreylistEntry, GreylistVerdict};
pub use rate::{RateLimiter, RateVerdict};
pub use store::{GreylistStore, MemoryGreylistStore, RateLimitStore, StoreError};
