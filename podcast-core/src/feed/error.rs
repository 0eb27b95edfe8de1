use thiserror::Error;

use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("show {0} not found")]
    ShowNotFound(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("invalid base url {0:?}")]
    InvalidBaseUrl(String),
}

pub type FeedResult<T> = Result<T, FeedError>;
