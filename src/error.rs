use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::client::SourceError;
use crate::db::store::StoreError;

/// Failure of an engine operation. Detection itself never fails; only its
/// collaborators do.
#[derive(Debug)]
pub enum NilmError {
    Store(StoreError),
    Source(SourceError),
    /// A configuration update was rejected; the previous one stays in effect.
    Config(String),
}

impl Display for NilmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NilmError::Store(e) => write!(f, "store error: {}", e),
            NilmError::Source(e) => write!(f, "history source error: {}", e),
            NilmError::Config(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl Error for NilmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NilmError::Store(e) => Some(e),
            NilmError::Source(e) => Some(e),
            NilmError::Config(_) => None,
        }
    }
}

impl From<StoreError> for NilmError {
    fn from(value: StoreError) -> Self {
        NilmError::Store(value)
    }
}

impl From<SourceError> for NilmError {
    fn from(value: SourceError) -> Self {
        NilmError::Source(value)
    }
}
