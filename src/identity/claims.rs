use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};

use crate::identity::error::{AuthError, AuthResult};

/// The subset of Azure AD access-token claims the relay cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub roles: Vec<String>,
    pub appid: Option<String>,
    pub azp: Option<String>,
    pub oid: Option<String>,
    pub sub: Option<String>,
    pub tid: Option<String>,
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// v1 tokens carry `appid`, v2 tokens carry `azp`.
    pub fn caller_app_id(&self) -> Option<&str> {
        self.appid.as_deref().or(self.azp.as_deref())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|candidate| candidate == role)
    }
}

/// Reads the claims without checking the signature. Diagnostics only.
pub fn peek_claims(token: &str) -> AuthResult<Claims> {
    let header = decode_header(token).map_err(|err| AuthError::InvalidToken(err.to_string()))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|err| AuthError::InvalidToken(err.to_string()))
}
