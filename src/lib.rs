// Engine configuration and named retry constants
pub mod config;

// Error taxonomy
pub mod error;

// Encrypted credential storage (Integration records)
pub mod credentials;

// OAuth flow: state tokens, code exchange, account binding
pub mod oauth;

// Provider adapters (Google, Meta, TikTok, LinkedIn)
pub mod providers;

// Raw rows → canonical schema
pub mod normalize;

// Metric storage and the chunked upsert writer
pub mod metrics;

// Durable job queue, runner, and scheduler
pub mod jobs;

// HTTP API
pub mod api;
