//! Configuration types and loading

mod config;

pub use config::{
    AuthConfig, Config, LlmConfig, MaskingConfig, RetryPolicy, ServerDescriptor, TimeoutConfig,
    ToolOverride, TransportKind,
};
