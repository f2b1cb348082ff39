#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// Missing credential or provider configuration. Raised before any side effect.
    #[error("configuration error: {0}")]
    Config(String),
    /// The instance is not in a state that allows the requested action.
    #[error("{0}")]
    InvalidState(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("{0:#}")]
    Provider(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}
