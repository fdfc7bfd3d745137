//! External collaborators of the pipeline.
//!
//! - Firehose subscription (`JetstreamSource`)
//! - Social-graph API (`XrpcClient`)

mod firehose;
mod graph_api;

pub use firehose::{EventSource, JetstreamSource, MessageStream};
pub use graph_api::{GraphApi, MAX_PROFILES_PER_CALL, XrpcClient};
