#![forbid(unsafe_code)]

// Auth module - bearer tokens identifying the user behind a connection

pub mod jwt;

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub name: String,
    pub exp: usize,
}

#[derive(Debug)]
pub enum AuthError {
    InvalidToken,
    TokenExpired,
    TokenCreation(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::TokenCreation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Token error"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Resolves the user behind an upgrade request.
///
/// Without a secret every connection is anonymous. With one, a missing token is
/// anonymous too, but a token that is present has to be valid.
pub fn authenticate(token: Option<&str>, secret: Option<&str>) -> Result<Option<String>, AuthError> {
    match (secret, token) {
        (Some(secret), Some(token)) => jwt::validate_token(token, secret).map(|claims| Some(claims.sub)),
        _ => Ok(None),
    }
}
