use crate::entity::ResourceType;

/// Errors raised by core types: configuration and entity decoding.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(String),
    #[error("decode {resource} at {path}: {source}")]
    Decode {
        resource: ResourceType,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
