//! REST route authorization
//!
//! Administrative routes fall in one of three classes. Device-gateway routes
//! match a static `{methods, pattern}` table and need the shared secret.
//! Public routes need nothing. Everything else needs an end-user session
//! token, checked by an [`IdentityVerifier`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::config::AuthConfig;

/// Header carrying the device-gateway shared secret.
pub const GATEWAY_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    DeviceGateway,
    EndUser,
    Public,
}

pub struct GatewayRouteRule {
    pub methods: &'static [&'static str],
    pub pattern: Regex,
}

fn rule(methods: &'static [&'static str], pattern: &str) -> GatewayRouteRule {
    GatewayRouteRule {
        methods,
        pattern: Regex::new(pattern).expect("valid gateway route pattern"),
    }
}

static GATEWAY_ROUTE_RULES: Lazy<Vec<GatewayRouteRule>> = Lazy::new(|| {
    vec![
        rule(&["GET"], r"^/connections/?$"),
        rule(&["GET", "DELETE"], r"^/connections/[^/]+/?$"),
        rule(&["POST"], r"^/connections/[^/]+/send/?$"),
        rule(&["GET"], r"^/connections/[^/]+/configuration/?$"),
        rule(&["GET"], r"^/statistics/?$"),
    ]
});

static PUBLIC_ROUTES: &[(&str, &str)] = &[("GET", "/health")];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteAuthError {
    #[error("missing gateway key")]
    MissingGatewayKey,
    #[error("invalid gateway key")]
    InvalidGatewayKey,
    #[error("missing session token")]
    MissingSessionToken,
    #[error("invalid session token")]
    InvalidSessionToken,
}

impl From<RouteAuthError> for ApiError {
    fn from(e: RouteAuthError) -> Self {
        debug!(error = %e, "route authorization failed");
        ApiError::Unauthorized
    }
}

/// Validates end-user session tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// The user id a token belongs to, or `None` when the token is not valid.
    async fn verify(&self, token: &str) -> Result<Option<String>>;
}

/// Asks an external identity service. `GET {url}` with the token as bearer;
/// 2xx with a user id means valid, 401/403 means invalid.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    #[serde(alias = "user_id", alias = "id")]
    user_id: String,
}

impl HttpIdentityVerifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building identity client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .context("identity service request failed")?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            s if s.is_success() => {
                let body: IdentityResponse = resp.json().await.context("identity response")?;
                Ok(Some(body.user_id))
            }
            s => anyhow::bail!("identity service answered {s}"),
        }
    }
}

/// Fixed token list from configuration.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<String>> {
        Ok(self.tokens.get(token).cloned())
    }
}

pub fn identity_from_config(cfg: &AuthConfig, timeout: Duration) -> Result<Arc<dyn IdentityVerifier>> {
    Ok(match &cfg.identity_url {
        Some(url) => Arc::new(HttpIdentityVerifier::new(url.clone(), timeout)?),
        None => Arc::new(StaticTokenVerifier::new(
            cfg.static_tokens
                .iter()
                .map(|t| (t.token.clone(), t.user_id.clone())),
        )),
    })
}

/// The authenticated end user, set by [`route_guard`] on end-user routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

pub struct GatewayRouteGuard {
    gateway_key: String,
    bypass: bool,
    identity: Arc<dyn IdentityVerifier>,
}

impl GatewayRouteGuard {
    pub fn new(gateway_key: impl Into<String>, bypass: bool, identity: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            gateway_key: gateway_key.into(),
            bypass,
            identity,
        }
    }

    pub fn classify(method: &Method, path: &str) -> RouteClass {
        let method = method.as_str();
        if PUBLIC_ROUTES.iter().any(|(m, p)| *m == method && *p == path) {
            return RouteClass::Public;
        }
        let is_gateway = GATEWAY_ROUTE_RULES
            .iter()
            .any(|r| r.methods.contains(&method) && r.pattern.is_match(path));
        if is_gateway {
            RouteClass::DeviceGateway
        } else {
            RouteClass::EndUser
        }
    }

    pub fn check_gateway_key(&self, headers: &HeaderMap) -> Result<(), RouteAuthError> {
        let presented = gateway_key(headers).ok_or(RouteAuthError::MissingGatewayKey)?;
        if keys_match(presented.as_bytes(), self.gateway_key.as_bytes()) {
            Ok(())
        } else {
            Err(RouteAuthError::InvalidGatewayKey)
        }
    }

    pub async fn check_session(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let token = bearer_token(headers).ok_or(RouteAuthError::MissingSessionToken)?;
        match self.identity.verify(token).await {
            Ok(Some(user_id)) => Ok(AuthUser(user_id)),
            Ok(None) => Err(RouteAuthError::InvalidSessionToken.into()),
            Err(e) => {
                warn!(error = %e, "identity service unavailable");
                Err(ApiError::ServiceUnavailable(e.to_string()))
            }
        }
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn keys_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// `x-api-key`, or a bearer token when that header is absent.
fn gateway_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(GATEWAY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| bearer_token(headers))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Axum middleware enforcing [`GatewayRouteGuard`].
pub async fn route_guard(
    State(guard): State<Arc<GatewayRouteGuard>>,
    mut req: Request,
    next: Next,
) -> Response {
    if guard.bypass {
        return next.run(req).await;
    }
    let class = GatewayRouteGuard::classify(req.method(), req.uri().path());
    match class {
        RouteClass::Public => {}
        RouteClass::DeviceGateway => {
            if let Err(e) = guard.check_gateway_key(req.headers()) {
                warn!(path = %req.uri().path(), error = %e, "gateway route rejected");
                return ApiError::from(e).into_response();
            }
        }
        RouteClass::EndUser => match guard.check_session(req.headers()).await {
            Ok(user) => {
                req.extensions_mut().insert(user);
            }
            Err(e) => return e.into_response(),
        },
    }
    next.run(req).await
}
