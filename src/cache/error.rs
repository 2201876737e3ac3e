//! Cache coordinator errors.

use thiserror::Error;

use crate::backend::BackendError;
use crate::store::StoreError;
use crate::surrogate::SurrogateError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("origin failure: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error("fragment nesting deeper than {0} levels")]
    NestingTooDeep(usize),
}

impl CacheError {
    /// Whether the failure came from the origin rather than the cache itself.
    pub fn is_origin_failure(&self) -> bool {
        match self {
            CacheError::Backend(_) => true,
            CacheError::Surrogate(SurrogateError::Fragment { source, .. }) => source.is_origin_failure(),
            _ => false,
        }
    }
}
