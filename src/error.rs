use thiserror::Error;

/// Failures surfaced by Spotify API operations.
///
/// Credential problems are fatal for the single operation that hit them and
/// require user intervention (re-linking the account), not a retry. A missing
/// single item during a batch fetch is *not* an error; those come back as
/// `None` from the per-entity helpers and are dropped from the batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("user {0} has no linked spotify account")]
    NoLinkedAccount(String),

    #[error("no usable access token for user {0}")]
    NoAccessToken(String),

    #[error("search failed with status {0}")]
    SearchFailed(u16),
}
