/// Result type alias for source fetches.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Fetch failures. `Clone` so a single in-flight refresh can hand the same
/// error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Transient network error for {url}: {message}")]
    Transient { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid proxy {proxy}: {message}")]
    Proxy { proxy: String, message: String },

    #[error("No rows recovered after {attempts} attempts (last: {last})")]
    Exhausted { attempts: u32, last: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub(crate) fn parse(context: &str, err: impl std::fmt::Display) -> Self {
        FetchError::Parse(format!("{context}: {err}"))
    }
}
