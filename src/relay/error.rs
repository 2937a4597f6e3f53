use crate::messaging::error::DeliveryError;
use crate::relay::request::ValidationErrors;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("one or more validation errors occurred")]
    Validation(ValidationErrors),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub type RelayResult<T> = Result<T, RelayError>;
