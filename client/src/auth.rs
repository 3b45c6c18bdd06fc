//! Token handling for the client.
//!
//! Tokens come from the REST API's token proxy. A token is refreshed
//! proactively once the local clock shows less than 30 seconds of
//! validity, so long-running streams never run into a hard expiry.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Seconds of remaining validity below which a token is renewed.
const REFRESH_WINDOW: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not connect to {0}")]
    Connection(String),
    #[error("authentication failed")]
    Unauthorized,
    #[error("unexpected token response: {0}")]
    BadResponse(String),
}

/// Token response of the REST API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expires: i64,
    pub refresh_token: String,
    pub refresh_expires: i64,
    pub scope: String,
}

impl Token {
    /// Whether the access token should be renewed now.
    pub fn needs_refresh(&self) -> bool {
        self.expires - Utc::now().timestamp() < REFRESH_WINDOW
    }

    /// Whether the refresh token itself is still usable.
    pub fn can_refresh(&self) -> bool {
        self.refresh_expires - Utc::now().timestamp() >= REFRESH_WINDOW
    }
}

/// Client-side token fetch and refresh.
pub struct Auth {
    token_url: String,
    pub token: Option<Token>,
}

impl Auth {
    pub fn new(token_url: String) -> Self {
        Self { token_url, token: None }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<Token, AuthError> {
        let response = reqwest::Client::new()
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|_| AuthError::Connection(self.token_url.clone()))?;
        if response.status().is_client_error() {
            return Err(AuthError::Unauthorized);
        }
        response
            .error_for_status()
            .map_err(|e| AuthError::BadResponse(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::BadResponse(e.to_string()))
    }

    /// Create a token from username and password.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<Token, AuthError> {
        let token = self
            .request_token(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
            ])
            .await?;
        self.token = Some(token.clone());
        Ok(token)
    }

    /// A valid access token, renewed through the refresh grant when the
    /// expiry window closes.
    pub async fn access_token(&mut self) -> Result<String, AuthError> {
        let token = self.token.clone().ok_or(AuthError::Unauthorized)?;
        if !token.needs_refresh() {
            return Ok(token.access_token);
        }
        if !token.can_refresh() {
            return Err(AuthError::Unauthorized);
        }
        let renewed = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh-token", token.refresh_token.as_str()),
            ])
            .await?;
        self.token = Some(renewed.clone());
        Ok(renewed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: i64, refresh_in: i64) -> Token {
        let now = Utc::now().timestamp();
        Token {
            access_token: "a".to_string(),
            token_type: "Bearer".to_string(),
            expires: now + expires_in,
            refresh_token: "r".to_string(),
            refresh_expires: now + refresh_in,
            scope: "openid".to_string(),
        }
    }

    #[test]
    fn test_refresh_window() {
        assert!(!token(300, 600).needs_refresh());
        assert!(token(10, 600).needs_refresh());
        assert!(token(-10, 600).needs_refresh());
    }

    #[test]
    fn test_refresh_token_expiry() {
        assert!(token(10, 600).can_refresh());
        assert!(!token(10, 5).can_refresh());
    }
}
