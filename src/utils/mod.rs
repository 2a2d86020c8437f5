pub mod deterministic_uuid;
pub mod jitter;
pub mod url;

pub use deterministic_uuid::{generate_channel_uuid, generate_deterministic_uuid, generate_stream_uuid};
pub use url::UrlUtils;
