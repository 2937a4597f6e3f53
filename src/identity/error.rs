#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("credential unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed ({code}): {message}")]
    AuthenticationFailed { code: String, message: String },
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token lacks required role '{0}'")]
    MissingRole(String),
}

impl AuthError {
    /// Azure AD rejects unknown or unconsented scopes with AADSTS70011.
    pub fn is_scope_problem(&self) -> bool {
        match self {
            AuthError::AuthenticationFailed { code, message } => {
                code.contains("AADSTS70011")
                    || code.contains("invalid_scope")
                    || message.contains("AADSTS70011")
                    || message.contains("invalid_scope")
            }
            _ => false,
        }
    }

    /// Missing roles are an authorization failure; everything else is authentication.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, AuthError::MissingRole(_))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
