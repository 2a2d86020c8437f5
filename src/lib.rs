pub mod config;
pub mod errors;
pub mod health;
pub mod matching;
pub mod models;
pub mod quality;
pub mod ranking;
pub mod registry;
pub mod sync;
pub mod utils;

pub use config::EngineConfig;
pub use errors::{ProbeError, ResolverError, ResolverResult};
pub use registry::ChannelRegistry;
