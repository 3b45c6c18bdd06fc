//! OIDC auth gate and token endpoints.
//!
//! The validator builds lazily: every protected request probes the
//! provider's discovery document (5 s timeout) until the first success,
//! and a failed init is never cached. Token requests are proxied to the
//! provider and normalized to one response shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::ApiError;
use crate::types::AppContext;

/// Timeout for every interaction with the OIDC provider.
const OIDC_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback token lifetime when the provider reports none.
const DEFAULT_EXPIRY_SECS: i64 = 180;

/// The provider's discovery document, reduced to the endpoints we use.
#[derive(Clone, Debug, Deserialize)]
pub struct Discovery {
    pub issuer: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
}

#[derive(Clone, Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Clone, Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
    #[serde(rename = "use", default)]
    usage: Option<String>,
}

/// Decoded claims of a validated bearer token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenPayload {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Normalized token response of the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expires: i64,
    pub refresh_token: String,
    pub refresh_expires: i64,
    pub scope: String,
}

/// Basic user info derived from token claims.
#[derive(Clone, Debug, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub last_name: String,
    pub first_name: String,
    pub email: String,
}

#[derive(Debug)]
struct OidcValidator {
    discovery: Discovery,
    keys: Vec<Jwk>,
}

impl OidcValidator {
    fn validate(&self, token: &str) -> Result<TokenPayload, ApiError> {
        let header = decode_header(token).map_err(|_| ApiError::Unauthorized)?;
        let key = self
            .keys
            .iter()
            .filter(|k| k.usage.as_deref().unwrap_or("sig") == "sig")
            .find(|k| header.kid.as_deref() == Some(k.kid.as_str()))
            .or_else(|| self.keys.first())
            .ok_or(ApiError::Unauthorized)?;
        let decoding_key =
            DecodingKey::from_rsa_components(&key.n, &key.e).map_err(|_| ApiError::Unauthorized)?;
        let algorithm = key
            .alg
            .as_deref()
            .and_then(|alg| alg.parse::<Algorithm>().ok())
            .unwrap_or(Algorithm::RS256);
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.discovery.issuer.as_str()]);
        validation.validate_aud = false;
        decode::<TokenPayload>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|error| {
                warn!(error = %error, "token validation failed");
                ApiError::Unauthorized
            })
    }
}

/// Lazily initialized OIDC validator shared by all requests.
#[derive(Debug)]
pub struct SafeAuth {
    discovery_url: String,
    http: reqwest::Client,
    inner: Mutex<Option<Arc<OidcValidator>>>,
}

impl SafeAuth {
    pub fn new(discovery_url: String, http: reqwest::Client) -> Self {
        Self {
            discovery_url: discovery_url.trim().to_string(),
            http,
            inner: Mutex::new(None),
        }
    }

    pub fn discovery_url(&self) -> &str {
        &self.discovery_url
    }

    async fn validator(&self) -> Result<Arc<OidcValidator>, ApiError> {
        let mut guard = self.inner.lock().await;
        if let Some(validator) = guard.as_ref() {
            return Ok(validator.clone());
        }
        let unavailable =
            || ApiError::Unavailable("OIDC server unavailable, cannot validate token.".to_string());
        if self.discovery_url.is_empty() {
            return Err(unavailable());
        }
        let discovery: Discovery = self
            .http
            .get(&self.discovery_url)
            .timeout(OIDC_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|error| {
                error!(error = %error, "could not reach the OIDC discovery document");
                unavailable()
            })?
            .json()
            .await
            .map_err(|_| unavailable())?;
        let jwks: JwkSet = self
            .http
            .get(&discovery.jwks_uri)
            .timeout(OIDC_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|error| {
                error!(error = %error, "could not fetch the provider key set");
                unavailable()
            })?
            .json()
            .await
            .map_err(|_| unavailable())?;
        let validator = Arc::new(OidcValidator { discovery, keys: jwks.keys });
        *guard = Some(validator.clone());
        Ok(validator)
    }

    /// The provider's discovery document, initializing the validator on
    /// first use.
    pub async fn discovery(&self) -> Result<Discovery, ApiError> {
        Ok(self.validator().await?.discovery.clone())
    }

    /// Validate the bearer token of a request, yielding its claims.
    pub async fn required(&self, headers: &HeaderMap) -> Result<TokenPayload, ApiError> {
        let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
        self.validator().await?.validate(&token)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// User-info derivation
// ---------------------------------------------------------------------------

/// Claim names per user-info field, in priority order. Claim keys are
/// normalized to lowercase with underscores turned into hyphens.
const USERINFO_KEYS: [(&str, &[&str]); 4] = [
    ("username", &["preferred-username", "user-name", "uid", "sub"]),
    ("last_name", &["last-name", "family-name", "surname", "name"]),
    ("first_name", &["first-name", "given-name"]),
    ("email", &["mail", "email"]),
];

fn normalize_claims(claims: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    claims
        .iter()
        .map(|(key, value)| {
            let key = key.to_lowercase().replace('_', "-");
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Derive user info from a normalized claim map; `None` when any required
/// field stays empty.
pub fn get_userinfo(claims: &BTreeMap<String, Value>) -> Option<UserInfo> {
    let normalized = normalize_claims(claims);
    let mut fields: BTreeMap<&str, String> = BTreeMap::new();
    for (field, candidates) in USERINFO_KEYS {
        for candidate in candidates {
            if let Some(value) = normalized.get(*candidate).filter(|v| !v.is_empty()) {
                fields.insert(field, value.clone());
                break;
            }
        }
    }
    let required = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
    Some(UserInfo {
        username: required("username")?,
        last_name: required("last_name")?,
        first_name: required("first_name")?,
        email: fields.get("email").cloned().unwrap_or_default(),
    })
}

fn claims_map(payload: &TokenPayload) -> BTreeMap<String, Value> {
    let mut claims = payload.extra.clone();
    claims.insert("sub".to_string(), Value::from(payload.sub.clone()));
    if let Some(email) = &payload.email {
        claims.insert("email".to_string(), Value::from(email.clone()));
    }
    claims
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /auth/v2/status` — the decoded claims of a valid token.
pub async fn get_token_status(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Json<TokenPayload>, ApiError> {
    Ok(Json(ctx.auth.required(&headers).await?))
}

/// `GET /auth/v2/userinfo` — user info from claims, falling back to the
/// provider's userinfo endpoint.
pub async fn userinfo(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Json<UserInfo>, ApiError> {
    let payload = ctx.auth.required(&headers).await?;
    if let Some(info) = get_userinfo(&claims_map(&payload)) {
        return Ok(Json(info));
    }
    let discovery = ctx.auth.discovery().await?;
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let response: BTreeMap<String, Value> = ctx
        .http
        .get(&discovery.userinfo_endpoint)
        .timeout(OIDC_TIMEOUT)
        .header("Authorization", authorization)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|_| ApiError::Unauthorized)?
        .json()
        .await
        .map_err(|_| ApiError::NotFound("Not found".to_string()))?;
    get_userinfo(&response)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Not found".to_string()))
}

/// `GET /auth/v2/.well-known/openid-configuration` — redirect to the
/// provider's discovery document.
pub async fn open_id_config(State(ctx): State<AppContext>) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, ctx.auth.discovery_url())
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Form body of the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
    #[serde(default, alias = "refresh-token")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_grant_type() -> String {
    "password".to_string()
}

/// `POST /auth/v2/token` — create or refresh a token via the provider.
pub async fn fetch_or_refresh_token(
    State(ctx): State<AppContext>,
    Form(request): Form<TokenRequest>,
) -> Result<Json<Token>, ApiError> {
    let discovery = ctx.auth.discovery().await?;
    let mut form: Vec<(&str, String)> = vec![
        (
            "client_id",
            request
                .client_id
                .filter(|v| !v.is_empty() && v != "None")
                .unwrap_or_else(|| ctx.config.oidc_client_id.clone()),
        ),
        (
            "client_secret",
            request
                .client_secret
                .unwrap_or_else(|| ctx.config.oidc_client_secret.clone()),
        ),
        ("grant_type", request.grant_type.clone()),
    ];
    if request.grant_type == "password" {
        form.push(("username", request.username.unwrap_or_default()));
        form.push(("password", request.password.unwrap_or_default()));
    } else {
        form.push(("refresh_token", request.refresh_token.unwrap_or_default()));
    }
    let form: Vec<(&str, String)> = form.into_iter().filter(|(_, v)| !v.is_empty()).collect();

    let response = ctx
        .http
        .post(&discovery.token_endpoint)
        .timeout(OIDC_TIMEOUT)
        .form(&form)
        .send()
        .await
        .map_err(|error| {
            error!(error = %error, "could not connect to the OIDC server");
            ApiError::Unavailable("Could not connect to the OIDC server".to_string())
        })?;
    if response.status().is_client_error() {
        return Err(ApiError::Unauthorized);
    }
    let token_data: Value = response
        .error_for_status()
        .map_err(|_| ApiError::Unavailable("Could not connect to the OIDC server".to_string()))?
        .json()
        .await
        .map_err(|_| ApiError::Unavailable("Could not connect to the OIDC server".to_string()))?;
    Ok(Json(normalize_token(&token_data)?))
}

/// Normalize a provider token response, synthesizing absolute expiry
/// instants from relative lifetimes when needed.
pub fn normalize_token(token_data: &Value) -> Result<Token, ApiError> {
    let now = Utc::now().timestamp();
    let pick = |keys: &[&str]| -> Option<i64> {
        keys.iter()
            .find_map(|key| token_data.get(*key).and_then(Value::as_i64))
    };
    let expires = pick(&["exp", "expires", "expires_at"]).unwrap_or_else(|| {
        now + pick(&["expires_in"]).unwrap_or(DEFAULT_EXPIRY_SECS)
    });
    let refresh_expires = pick(&["refresh_exp", "refresh_expires", "refresh_expires_at"])
        .unwrap_or_else(|| now + pick(&["refresh_expires_in"]).unwrap_or(DEFAULT_EXPIRY_SECS));
    let field = |key: &str| -> Result<String, ApiError> {
        token_data
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Internal(format!("token response misses {key}")))
    };
    Ok(Token {
        access_token: field("access_token")?,
        token_type: field("token_type")?,
        expires,
        refresh_token: field("refresh_token")?,
        refresh_expires,
        scope: field("scope")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_userinfo_priority_lists() {
        let claims: BTreeMap<String, Value> = [
            ("preferred_username".to_string(), json!("jdoe")),
            ("given_name".to_string(), json!("Jane")),
            ("family_name".to_string(), json!("Doe")),
            ("email".to_string(), json!("jane@example.org")),
        ]
        .into();
        let info = get_userinfo(&claims).unwrap();
        assert_eq!(info.username, "jdoe");
        assert_eq!(info.first_name, "Jane");
        assert_eq!(info.last_name, "Doe");
        assert_eq!(info.email, "jane@example.org");
    }

    #[test]
    fn test_userinfo_requires_name_fields() {
        let claims: BTreeMap<String, Value> =
            [("preferred_username".to_string(), json!("jdoe"))].into();
        assert!(get_userinfo(&claims).is_none());
    }

    #[test]
    fn test_userinfo_email_is_optional() {
        let claims: BTreeMap<String, Value> = [
            ("uid".to_string(), json!("jdoe")),
            ("given-name".to_string(), json!("Jane")),
            ("surname".to_string(), json!("Doe")),
        ]
        .into();
        let info = get_userinfo(&claims).unwrap();
        assert_eq!(info.email, "");
    }

    #[test]
    fn test_normalize_token_synthesizes_expiry() {
        let now = Utc::now().timestamp();
        let token = normalize_token(&json!({
            "access_token": "a",
            "token_type": "Bearer",
            "refresh_token": "r",
            "scope": "openid",
            "expires_in": 300,
        }))
        .unwrap();
        assert!(token.expires >= now + 299);
        assert!(token.refresh_expires >= now + DEFAULT_EXPIRY_SECS - 1);
    }

    #[test]
    fn test_normalize_token_prefers_absolute_expiry() {
        let token = normalize_token(&json!({
            "access_token": "a",
            "token_type": "Bearer",
            "refresh_token": "r",
            "scope": "openid",
            "exp": 1234,
            "refresh_expires": 5678,
        }))
        .unwrap();
        assert_eq!(token.expires, 1234);
        assert_eq!(token.refresh_expires, 5678);
    }
}
