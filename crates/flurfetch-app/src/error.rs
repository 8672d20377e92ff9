//! Application-level error type shared by the CLI entry points.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::AppConfigError;
use crate::convert::ConvertError;
use crate::download::FetchError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}
