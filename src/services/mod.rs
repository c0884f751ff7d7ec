//! Service layer: vision model client, extraction pipeline, background jobs,
//! Redis cache and file storage.

pub mod cache;
pub mod extraction;
pub mod jobs;
pub mod prompts;
pub mod storage;
pub mod vision;

pub use cache::RedisCache;
pub use extraction::ExtractionService;
pub use jobs::ExtractionJobs;
pub use storage::FileStore;
pub use vision::{AnthropicVision, VisionModel};
