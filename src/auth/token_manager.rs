use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::token_store::TokenStore;
use crate::config::{Config, DEFAULT_TOKEN_LIFETIME_SECS, HTTP_TIMEOUT_SECS, TOKEN_SAFETY_MARGIN_SECS};
use crate::error::{AppError, Result};
use crate::types::TokenPair;

// ---------------------------------------------------------------------------
// OAuth endpoint
// ---------------------------------------------------------------------------

/// The provider's token endpoint.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair>;
    async fn exchange_code(&self, auth_code: &str) -> Result<TokenPair>;
}

/// OAuth2 client using form posts and HTTP Basic client credentials.
pub struct HttpOAuthClient {
    client: reqwest::Client,
    token_url: String,
    redirect_uri: String,
    client_id: String,
    client_secret: String,
}

impl HttpOAuthClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            token_url: cfg.token_url.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
        })
    }

    async fn grant(&self, form: &[(&str, &str)], previous_refresh: Option<&str>) -> Result<TokenPair> {
        let resp = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Auth(format!("token endpoint unreachable: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::Auth(format!("token response unreadable: {e}")))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(500).collect();
            return Err(AppError::Auth(format!("token endpoint returned {status}: {snippet}")));
        }

        parse_token_response(&body, previous_refresh)
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.grant(
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
            Some(refresh_token),
        )
        .await
    }

    async fn exchange_code(&self, auth_code: &str) -> Result<TokenPair> {
        self.grant(
            &[
                ("grant_type", "authorization_code"),
                ("code", auth_code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ],
            None,
        )
        .await
    }
}

/// Build a pair from a token endpoint body. A missing `refresh_token` keeps
/// the previous one; the provider does not always rotate it.
pub fn parse_token_response(body: &str, previous_refresh: Option<&str>) -> Result<TokenPair> {
    let v: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AppError::Auth(format!("token response is not JSON: {e}")))?;

    let access_token = v
        .get("access_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Auth("token response has no access_token".to_string()))?
        .to_string();

    let refresh_token = v
        .get("refresh_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .or(previous_refresh)
        .ok_or_else(|| AppError::Auth("token response has no refresh_token".to_string()))?
        .to_string();

    let expires_in = v
        .get("expires_in")
        .and_then(|x| x.as_i64().or_else(|| x.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

    Ok(TokenPair {
        access_token,
        refresh_token,
        expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
    })
}

// ---------------------------------------------------------------------------
// TokenManager
// ---------------------------------------------------------------------------

struct TokenState {
    pair: TokenPair,
    /// Bumped on every refresh attempt, successful or not.
    generation: u64,
    last_error: Option<String>,
}

/// Owns the live token pair and hands out access tokens that stay valid for
/// at least the safety margin.
///
/// Refresh is single-flight: the state lives behind one async mutex held for
/// the whole exchange, and a caller that queued behind an attempt adopts that
/// attempt's outcome (token or error) instead of issuing its own.
pub struct TokenManager {
    state: Mutex<TokenState>,
    /// Mirror of `TokenState::generation`, readable without the lock.
    generation: AtomicU64,
    oauth: Arc<dyn OAuthClient>,
    store: Arc<dyn TokenStore>,
    margin: chrono::Duration,
}

impl TokenManager {
    pub fn new(pair: TokenPair, oauth: Arc<dyn OAuthClient>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            state: Mutex::new(TokenState {
                pair,
                generation: 0,
                last_error: None,
            }),
            generation: AtomicU64::new(0),
            oauth,
            store,
            margin: chrono::Duration::seconds(TOKEN_SAFETY_MARGIN_SECS),
        }
    }

    /// Build a manager from persisted state, falling back to the configured
    /// seed refresh token, then to a one-time authorization code exchange.
    pub async fn bootstrap(
        cfg: &Config,
        oauth: Arc<dyn OAuthClient>,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        let pair = match store.load().await {
            Ok(Some(pair)) => Some(pair),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable token file: {e}");
                None
            }
        };

        let pair = match (pair, &cfg.refresh_token, &cfg.auth_code) {
            (Some(pair), _, _) => {
                info!(token_source = "token_file", "Using persisted tokens");
                pair
            }
            (None, Some(refresh), _) => {
                info!(token_source = "env", "Using refresh token from environment");
                TokenPair::seed(refresh.clone())
            }
            (None, None, Some(code)) => {
                info!("No refresh token available, exchanging authorization code");
                let pair = oauth.exchange_code(code).await?;
                store.save(&pair).await?;
                pair
            }
            (None, None, None) => {
                return Err(AppError::Config(
                    "no saved tokens, ENPHASE_REFRESH_TOKEN or ENPHASE_AUTH_CODE available".to_string(),
                ));
            }
        };

        Ok(Self::new(pair, oauth, store))
    }

    /// Current access token, refreshing first if it is expired or inside the
    /// safety margin. A failed refresh leaves the cached pair untouched.
    pub async fn get_valid_token(&self) -> Result<String> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        if state.pair.is_valid_at(Utc::now(), self.margin) {
            debug!("Using cached access token");
            return Ok(state.pair.access_token.clone());
        }

        // Someone refreshed while we waited for the lock: share their outcome.
        if state.generation != observed {
            return match &state.last_error {
                Some(msg) => Err(AppError::Auth(msg.clone())),
                None => Ok(state.pair.access_token.clone()),
            };
        }

        info!("Access token expired or near expiry, refreshing");
        self.refresh_locked(&mut state).await
    }

    /// Refresh after the provider rejected `stale`. If the cached token has
    /// already moved on, the newer token is returned without another exchange.
    pub async fn force_refresh(&self, stale: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.pair.access_token != stale && !state.pair.access_token.is_empty() {
            return Ok(state.pair.access_token.clone());
        }
        info!("Access token rejected by provider, refreshing");
        self.refresh_locked(&mut state).await
    }

    /// Snapshot of the live pair.
    pub async fn current(&self) -> TokenPair {
        self.state.lock().await.pair.clone()
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String> {
        let started = Instant::now();
        let result = self.oauth.refresh(&state.pair.refresh_token).await;

        state.generation += 1;
        self.generation.store(state.generation, Ordering::Release);

        match result {
            Ok(pair) => {
                let rotated = pair.refresh_token != state.pair.refresh_token;
                state.pair = pair;
                state.last_error = None;
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    token_rotated = rotated,
                    expires_at = %state.pair.expires_at,
                    "Token refreshed successfully",
                );
                // The provider may already have invalidated the old refresh
                // token, so a failed save must not discard the new pair.
                if let Err(e) = self.store.save(&state.pair).await {
                    error!("Failed to persist refreshed tokens: {e}");
                }
                Ok(state.pair.access_token.clone())
            }
            Err(e) => {
                let msg = match e {
                    AppError::Auth(msg) => msg,
                    other => other.to_string(),
                };
                error!(duration_ms = started.elapsed().as_millis() as u64, "Token refresh failed: {msg}");
                state.last_error = Some(msg.clone());
                Err(AppError::Auth(msg))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::auth::token_store::testing::MemoryTokenStore;

    fn manager(pair: TokenPair, oauth: Arc<FakeOAuth>, store: Arc<MemoryTokenStore>) -> TokenManager {
        TokenManager::new(pair, oauth, store)
    }

    #[tokio::test]
    async fn valid_token_needs_no_network_call() {
        let oauth = Arc::new(FakeOAuth::ok());
        let store = Arc::new(MemoryTokenStore::default());
        let mgr = manager(valid_pair(), oauth.clone(), store.clone());

        for _ in 0..3 {
            assert_eq!(mgr.get_valid_token().await.unwrap(), "access-0");
        }
        assert_eq!(oauth.calls(), 0);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_and_persisted() {
        let oauth = Arc::new(FakeOAuth::ok());
        let store = Arc::new(MemoryTokenStore::default());
        let mut pair = valid_pair();
        pair.expires_at = Utc::now() + chrono::Duration::seconds(30);
        let mgr = manager(pair, oauth.clone(), store.clone());

        assert_eq!(mgr.get_valid_token().await.unwrap(), "access-1");
        assert_eq!(oauth.calls(), 1);
        let saved = store.saved().expect("refreshed pair persisted");
        assert_eq!(saved.access_token, "access-1");
        assert_eq!(saved.refresh_token, "rt+1");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let oauth = Arc::new(FakeOAuth::slow(Duration::from_millis(50)));
        let store = Arc::new(MemoryTokenStore::default());
        let mgr = Arc::new(manager(TokenPair::seed("rt"), oauth.clone(), store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.get_valid_token().await })
            })
            .collect();

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "access-1");
        }
        assert_eq!(oauth.calls(), 1);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failed_refresh() {
        let oauth = Arc::new(FakeOAuth {
            delay: Duration::from_millis(50),
            ..FakeOAuth::failing()
        });
        let store = Arc::new(MemoryTokenStore::default());
        let mgr = Arc::new(manager(TokenPair::seed("rt"), oauth.clone(), store.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.get_valid_token().await })
            })
            .collect();

        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(err.is_auth(), "got {err:?}");
        }
        assert_eq!(oauth.calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_cached_pair_untouched() {
        let oauth = Arc::new(FakeOAuth::failing());
        let store = Arc::new(MemoryTokenStore::default());
        let mut pair = valid_pair();
        pair.expires_at = Utc::now() - chrono::Duration::minutes(5);
        let mgr = manager(pair.clone(), oauth.clone(), store.clone());

        assert!(mgr.get_valid_token().await.unwrap_err().is_auth());
        assert_eq!(mgr.current().await, pair);
        assert_eq!(store.save_count(), 0);

        // A later call tries again rather than replaying the old failure.
        assert!(mgr.get_valid_token().await.is_err());
        assert_eq!(oauth.calls(), 2);
    }

    #[tokio::test]
    async fn force_refresh_skips_exchange_when_token_already_rotated() {
        let oauth = Arc::new(FakeOAuth::ok());
        let store = Arc::new(MemoryTokenStore::default());
        let mgr = manager(valid_pair(), oauth.clone(), store.clone());

        assert_eq!(mgr.force_refresh("access-0").await.unwrap(), "access-1");
        // A second 401 reported against the old token reuses the new one.
        assert_eq!(mgr.force_refresh("access-0").await.unwrap(), "access-1");
        assert_eq!(oauth.calls(), 1);
    }

    #[tokio::test]
    async fn bootstrap_prefers_persisted_pair_over_env_seed() {
        let mut cfg = crate::testing::config();
        cfg.refresh_token = Some("env-rt".to_string());
        let oauth = Arc::new(FakeOAuth::ok());
        let store = Arc::new(MemoryTokenStore::with(valid_pair()));

        let mgr = TokenManager::bootstrap(&cfg, oauth.clone(), store).await.unwrap();
        assert_eq!(mgr.current().await.refresh_token, "rt");
        assert_eq!(oauth.calls(), 0);
    }

    #[tokio::test]
    async fn bootstrap_exchanges_auth_code_as_last_resort() {
        let mut cfg = crate::testing::config();
        cfg.refresh_token = None;
        cfg.auth_code = Some("code-123".to_string());
        let oauth = Arc::new(FakeOAuth::ok());
        let store = Arc::new(MemoryTokenStore::default());

        let mgr = TokenManager::bootstrap(&cfg, oauth, store.clone()).await.unwrap();
        assert_eq!(mgr.get_valid_token().await.unwrap(), "access-from-code-123");
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn token_response_keeps_previous_refresh_token_when_not_rotated() {
        let pair = parse_token_response(r#"{"access_token":"a","expires_in":"120"}"#, Some("old")).unwrap();
        assert_eq!(pair.refresh_token, "old");
        let remaining = pair.expires_at - Utc::now();
        assert!(remaining <= chrono::Duration::seconds(120));
        assert!(remaining > chrono::Duration::seconds(100));

        assert!(parse_token_response(r#"{"refresh_token":"r"}"#, None).unwrap_err().is_auth());
        assert!(parse_token_response("<html>", None).unwrap_err().is_auth());
    }
}
