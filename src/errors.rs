use crate::{models::scope::Scope, services::store::StoreError};
use thiserror::Error;

/// Errors that abort a whole pass rather than a single object.
#[derive(Debug, Error)]
pub enum JobError {
    /// Moved objects would land back under the source listing, or, when
    /// the scopes are equal, copy-then-delete would destroy the object.
    #[error("source scope `{from}` encloses destination scope `{to}`")]
    OverlappingScopes { from: Scope, to: Scope },

    #[error("listing `{scope}` failed: {error}")]
    List {
        scope: Scope,
        #[source]
        error: StoreError,
    },

    #[error("backend unavailable: {0}")]
    Backend(#[from] StoreError),
}
