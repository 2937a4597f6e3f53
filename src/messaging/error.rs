use crate::identity::error::AuthError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid service url '{0}'")]
    InvalidServiceUrl(String),
    #[error("bot credential unavailable: {0}")]
    Credential(#[from] AuthError),
    #[error("channel rejected activity ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid activity: {0}")]
    InvalidActivity(String),
    #[error("delivery timed out after {0}s")]
    Timeout(u64),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
