//! Crate-level error type.

use thiserror::Error;

use crate::store::StoreError;
use crate::tuple::TupleError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("key codec error: {0}")]
    Codec(#[from] TupleError),

    /// A validation key was supplied but holds no value in the store, so
    /// the task would be born already invalid.
    #[error("validation key has no value in the store")]
    InvalidValidation,
}
