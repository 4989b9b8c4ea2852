use sentinela_sources::FetchError;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Update already in progress")]
    Busy,

    #[error("Fetch stage failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store stage failed: {0}")]
    Store(String),
}
