pub mod claims;
pub mod credential;
pub mod error;
pub mod validator;
