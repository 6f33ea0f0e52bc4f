//! Token endpoint requests: refresh-token and authorization-code grants.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::store::{Credentials, TokenSet};
use crate::config::{ApiConfig, ClientAuth};
use crate::error::{AuthError, ParseError};
use crate::transport::{BasicAuth, Transport};

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 86_400;

/// Grant presented to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant<'a> {
    RefreshToken(&'a str),
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a str,
    },
}

impl Grant<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Grant::RefreshToken(_) => "refresh_token",
            Grant::AuthorizationCode { .. } => "authorization_code",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<serde_json::Value>,
}

/// Form fields for a token request. Client credentials are included unless
/// they travel in a Basic header.
pub fn grant_form<'a>(
    credentials: &'a Credentials,
    grant: &Grant<'a>,
    client_auth: ClientAuth,
) -> Vec<(&'static str, &'a str)> {
    let mut form = vec![("grant_type", grant.kind())];
    if client_auth == ClientAuth::Body {
        form.push(("client_id", credentials.client_id.as_str()));
        form.push(("client_secret", credentials.client_secret.as_str()));
    }
    match *grant {
        Grant::RefreshToken(token) => form.push(("refresh_token", token)),
        Grant::AuthorizationCode { code, redirect_uri } => {
            form.push(("code", code));
            form.push(("redirect_uri", redirect_uri));
        }
    }
    form
}

/// Turn a successful token endpoint body into a new [`TokenSet`].
///
/// A missing or empty `access_token` is an error. A missing `refresh_token`
/// keeps `previous_refresh`. A missing `expires_in` assumes one day.
pub fn parse_token_response(
    body: &str,
    previous_refresh: &str,
    now: DateTime<Utc>,
) -> Result<TokenSet, ParseError> {
    let parsed: TokenResponse = serde_json::from_str(body)?;

    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or(ParseError::MissingField("access_token"))?;
    let refresh_token = parsed
        .refresh_token
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| previous_refresh.to_string());
    let expires_in = parsed
        .expires_in
        .as_ref()
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

    Ok(TokenSet {
        access_token,
        refresh_token,
        obtained_at: Some(now),
        expires_in: Some(expires_in),
    })
}

/// POST a grant to the token endpoint and parse the answer.
pub async fn request_tokens(
    transport: &dyn Transport,
    api: &ApiConfig,
    credentials: &Credentials,
    grant: Grant<'_>,
    previous_refresh: &str,
) -> Result<TokenSet, AuthError> {
    let basic = match api.client_auth {
        ClientAuth::Basic => Some(BasicAuth {
            username: credentials.client_id.clone(),
            password: credentials.client_secret.clone(),
        }),
        ClientAuth::Body => None,
    };
    let form = grant_form(credentials, &grant, api.client_auth);

    tracing::debug!("Requesting tokens with {} grant", grant.kind());
    let resp = transport
        .post_form(&api.token_url, basic.as_ref(), &form)
        .await?;

    if !resp.is_success() {
        return Err(AuthError::Rejected {
            status: resp.status,
            body: resp.body,
        });
    }

    Ok(parse_token_response(&resp.body, previous_refresh, Utc::now())?)
}

/// URL the user opens in a browser to obtain an authorization code.
pub fn authorize_url(api: &ApiConfig, client_id: &str) -> Result<String, ParseError> {
    let url = reqwest::Url::parse_with_params(
        &api.authorize_url,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("scope", api.scope.as_str()),
            ("redirect_uri", api.redirect_uri.as_str()),
        ],
    )
    .map_err(|e| ParseError::Url(e.to_string()))?;
    Ok(url.to_string())
}

/// Try to open the authorization page in the user's browser (if the
/// `browser` feature is enabled). Returns whether a browser was launched.
pub fn open_authorize_page(url: &str) -> bool {
    #[cfg(feature = "browser")]
    {
        match webbrowser::open(url) {
            Ok(()) => return true,
            Err(e) => tracing::warn!(
                "Failed to open browser automatically: {}. User can use the manual link.",
                e
            ),
        }
    }
    #[cfg(not(feature = "browser"))]
    let _ = url;
    false
}
