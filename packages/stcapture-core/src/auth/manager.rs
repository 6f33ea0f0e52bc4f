//! Token lifecycle state machine.
//!
//! ```text
//! UNINITIALIZED -> LOADED -> {VALID, EXPIRED} -> REFRESHING -> {VALID, FAILED}
//! ```
//!
//! [`TokenManager::get_valid_token`] is the single entry point for callers that
//! need a bearer token. All transitions happen while holding one async mutex,
//! so concurrent callers that find the token expired trigger exactly one
//! refresh and then share its result.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::oauth::{self, Grant};
use super::store::{Credentials, TokenRecord, TokenStore};
use crate::config::ApiConfig;
use crate::error::AuthError;
use crate::sink::LogSink;
use crate::transport::Transport;

/// Token lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Uninitialized,
    Loaded,
    Valid,
    Expired,
    Refreshing,
    /// The last refresh or exchange failed. The next request reloads the store.
    Failed,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenState::Uninitialized => "UNINITIALIZED",
            TokenState::Loaded => "LOADED",
            TokenState::Valid => "VALID",
            TokenState::Expired => "EXPIRED",
            TokenState::Refreshing => "REFRESHING",
            TokenState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Result of token verification
/// - Valid - the API accepted the token
/// - Invalid - the API rejected the token (401/403)
/// - NetworkError - no verdict (unreachable, or some other status)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerifyResult {
    Valid,
    Invalid,
    NetworkError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantPreference {
    RefreshToken,
    AuthorizationCode,
}

#[derive(Default)]
struct Session {
    /// Pinned on the first load that carries a client id
    credentials: Option<Credentials>,
    record: Option<TokenRecord>,
}

pub struct TokenManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn TokenStore>,
    api: ApiConfig,
    sink: Arc<dyn LogSink>,
    session: Mutex<Session>,
    state: watch::Sender<TokenState>,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn TokenStore>,
        api: ApiConfig,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let (state, _) = watch::channel(TokenState::Uninitialized);
        Self {
            transport,
            store,
            api,
            sink,
            session: Mutex::new(Session::default()),
            state,
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TokenState> {
        self.state.subscribe()
    }

    pub fn api(&self) -> &ApiConfig {
        &self.api
    }

    /// Return an access token the API should accept, loading, validating,
    /// refreshing or exchanging as needed.
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        let mut session = self.session.lock().await;
        loop {
            match self.state() {
                TokenState::Uninitialized | TokenState::Failed => self.load(&mut session)?,
                TokenState::Loaded => {
                    if let Some(token) = self.check_loaded(&mut session).await? {
                        return Ok(token);
                    }
                }
                TokenState::Valid => match session.record.as_ref() {
                    Some(record) if !record.tokens.is_expired_at(Utc::now()) => {
                        return Ok(record.tokens.access_token.clone());
                    }
                    Some(_) => self.transition(TokenState::Expired, "access token reached its expiry"),
                    None => self.transition(TokenState::Uninitialized, "no token record in memory"),
                },
                // REFRESHING is only observed here when a previous renewal was
                // dropped mid-flight; start over from EXPIRED.
                TokenState::Expired | TokenState::Refreshing => {
                    return self.renew(&mut session, GrantPreference::RefreshToken).await;
                }
            }
        }
    }

    /// Report that the API rejected `rejected_token` with 401.
    ///
    /// Marks the state EXPIRED only when `rejected_token` is still the current
    /// token, so a caller holding a stale token does not force a second refresh.
    pub async fn invalidate(&self, rejected_token: &str) {
        let session = self.session.lock().await;
        let current = session
            .record
            .as_ref()
            .map(|r| r.tokens.access_token.as_str());
        if current == Some(rejected_token)
            && matches!(self.state(), TokenState::Valid | TokenState::Loaded)
        {
            self.transition(TokenState::Expired, "access token rejected by the API");
        }
    }

    /// Refresh unconditionally. Used by the periodic refresh timer.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let mut session = self.session.lock().await;
        if session.record.is_none() || self.state() == TokenState::Failed {
            self.load(&mut session)?;
        }
        self.renew(&mut session, GrantPreference::RefreshToken).await
    }

    /// Store a freshly issued authorization code and exchange it for tokens.
    pub async fn authorize_with_code(&self, code: &str) -> Result<String, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(self.fail(AuthError::ReauthorizationRequired));
        }

        let mut session = self.session.lock().await;
        if session.record.is_none() || self.state() == TokenState::Failed {
            self.load(&mut session)?;
        }
        if let Some(record) = session.record.as_mut() {
            record.auth_code = code.to_string();
            if let Err(e) = self.store.save(record) {
                return Err(self.fail(e.into()));
            }
        }
        self.renew(&mut session, GrantPreference::AuthorizationCode)
            .await
    }

    /// Current token record, loading the store if nothing is in memory yet.
    pub async fn current_record(&self) -> Result<TokenRecord, AuthError> {
        let mut session = self.session.lock().await;
        if session.record.is_none() {
            self.load(&mut session)?;
        }
        session
            .record
            .clone()
            .ok_or(AuthError::ReauthorizationRequired)
    }

    /// Check a token with a lightweight authenticated GET of the device list.
    pub async fn verify_token(&self, access_token: &str) -> TokenVerifyResult {
        let url = format!("{}/devices", self.api.api_base);
        match self.transport.get(&url, access_token).await {
            Ok(resp) if resp.is_success() => TokenVerifyResult::Valid,
            Ok(resp) if resp.is_auth_rejection() => TokenVerifyResult::Invalid,
            Ok(resp) => {
                tracing::debug!("Token verification returned status {}", resp.status);
                TokenVerifyResult::NetworkError(format!("Server returned {}", resp.status))
            }
            Err(e) => {
                tracing::debug!("Token verification network error: {}", e);
                TokenVerifyResult::NetworkError(e.to_string())
            }
        }
    }

    fn load(&self, session: &mut Session) -> Result<(), AuthError> {
        let mut record = match self.store.load() {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e.into())),
        };

        match &session.credentials {
            Some(pinned) => record.credentials = pinned.clone(),
            None if !record.credentials.client_id.is_empty() => {
                session.credentials = Some(record.credentials.clone());
            }
            None => tracing::warn!("Token store has no client_id"),
        }

        session.record = Some(record);
        self.transition(TokenState::Loaded, "token store loaded");
        Ok(())
    }

    /// LOADED -> VALID / EXPIRED, or straight to REFRESHING on first run.
    /// Returns a token only when the first-run exchange produced one.
    async fn check_loaded(&self, session: &mut Session) -> Result<Option<String>, AuthError> {
        let Some(record) = session.record.as_ref() else {
            self.transition(TokenState::Uninitialized, "no token record in memory");
            return Ok(None);
        };

        if record.needs_code_exchange() {
            self.sink
                .append_log("No tokens stored, exchanging authorization code...");
            return self
                .renew(session, GrantPreference::AuthorizationCode)
                .await
                .map(Some);
        }
        if !record.tokens.has_access_token() {
            self.transition(TokenState::Expired, "no access token stored");
            return Ok(None);
        }
        if record.tokens.is_expired_at(Utc::now()) {
            self.transition(TokenState::Expired, "stored access token has expired");
            return Ok(None);
        }

        let access_token = record.tokens.access_token.clone();
        match self.verify_token(&access_token).await {
            TokenVerifyResult::Valid => {
                self.transition(TokenState::Valid, "access token accepted by the API");
            }
            TokenVerifyResult::Invalid => {
                self.transition(TokenState::Expired, "access token rejected by the API");
            }
            TokenVerifyResult::NetworkError(reason) => {
                tracing::warn!("Could not verify access token, assuming valid: {}", reason);
                self.transition(TokenState::Valid, "verification inconclusive");
            }
        }
        Ok(None)
    }

    /// EXPIRED/LOADED -> REFRESHING -> VALID / FAILED.
    async fn renew(
        &self,
        session: &mut Session,
        preference: GrantPreference,
    ) -> Result<String, AuthError> {
        if session.record.is_none() {
            self.load(session)?;
        }
        let Some(record) = session.record.clone() else {
            return Err(self.fail(AuthError::ReauthorizationRequired));
        };

        let Some(grant) = choose_grant(&record, &self.api.redirect_uri, preference) else {
            return Err(self.fail(AuthError::ReauthorizationRequired));
        };
        let exchanging = matches!(grant, Grant::AuthorizationCode { .. });

        self.transition(TokenState::Refreshing, grant.kind());
        self.sink.append_log(if exchanging {
            "Exchanging authorization code for tokens..."
        } else {
            "Refreshing access token..."
        });

        let tokens = match oauth::request_tokens(
            self.transport.as_ref(),
            &self.api,
            &record.credentials,
            grant,
            &record.tokens.refresh_token,
        )
        .await
        {
            Ok(tokens) => tokens,
            Err(e) => return Err(self.fail(e)),
        };

        let mut updated = record.clone();
        updated.tokens = tokens;
        if exchanging {
            updated.auth_code.clear();
        }

        if let Err(e) = self.store.save(&updated) {
            // The new tokens still work for this process; the next successful
            // renewal retries the write.
            tracing::error!("Failed to persist renewed tokens: {}", e);
            self.sink
                .append_log(&format!("Warning: could not save tokens: {}", e));
        }

        let access_token = updated.tokens.access_token.clone();
        session.record = Some(updated);
        self.transition(TokenState::Valid, "tokens renewed");
        self.sink.append_log(if exchanging {
            "Authorization code exchanged, tokens saved"
        } else {
            "Access token refreshed"
        });
        Ok(access_token)
    }

    /// Enter FAILED and tell the user what happened.
    fn fail(&self, err: AuthError) -> AuthError {
        self.transition(TokenState::Failed, &err.to_string());
        if err.requires_manual_action() {
            tracing::error!("Manual re-authorization required: {}", err);
            self.sink.append_log(
                "Manual re-authorization required: obtain a new authorization code and run `stcapture connect --code <CODE>`",
            );
        } else {
            tracing::warn!("Token renewal failed: {}", err);
            self.sink
                .append_log(&format!("Token refresh failed: {}", err));
        }
        err
    }

    fn transition(&self, next: TokenState, reason: &str) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("Token state {} -> {} ({})", previous, next, reason);
        }
    }
}

fn choose_grant<'a>(
    record: &'a TokenRecord,
    redirect_uri: &'a str,
    preference: GrantPreference,
) -> Option<Grant<'a>> {
    let code = (!record.auth_code.is_empty()).then_some(Grant::AuthorizationCode {
        code: &record.auth_code,
        redirect_uri,
    });
    let refresh = record
        .tokens
        .has_refresh_token()
        .then_some(Grant::RefreshToken(&record.tokens.refresh_token));

    match preference {
        GrantPreference::RefreshToken => refresh.or(code),
        GrantPreference::AuthorizationCode => code.or(refresh),
    }
}
