use crate::config::{RegistryAuth, UpstreamConfig, DEFAULT_TOKEN_EXPIRY_SECS};
use crate::error::{MirrorError, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// An upstream bearer token for one authorization scope
#[derive(Clone)]
pub struct Token {
    value: String,
    scope: String,
    issued_at: SystemTime,
    ttl: Duration,
}

impl Token {
    pub fn new(value: String, scope: String, issued_at: SystemTime, ttl: Duration) -> Self {
        Self {
            value,
            scope,
            issued_at,
            ttl,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> SystemTime {
        self.issued_at + self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at() <= SystemTime::now()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Key/value store whose entries disappear once their expiry passes.
///
/// Expired entries must read as absent; whether they are physically removed is
/// up to the implementation.
pub trait ExpiringMap<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn insert(&self, key: String, value: V, expires_at: SystemTime);
}

/// In-process [`ExpiringMap`] backed by a `HashMap`
pub struct MemoryExpiringMap<V> {
    entries: RwLock<HashMap<String, (V, SystemTime)>>,
}

impl<V> MemoryExpiringMap<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for MemoryExpiringMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> ExpiringMap<V> for MemoryExpiringMap<V> {
    fn get(&self, key: &str) -> Option<V> {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(key).and_then(|(value, expires_at)| {
            if *expires_at > SystemTime::now() {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    fn insert(&self, key: String, value: V, expires_at: SystemTime) {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key, (value, expires_at));

        // Drop whatever has expired since the last insert
        let now = SystemTime::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

/// Acquires and caches upstream bearer tokens, one exchange per scope at a time.
pub struct TokenStore {
    client: Client,
    auth_url: String,
    service: String,
    credentials: Option<RegistryAuth>,
    timeout: Duration,
    tokens: Arc<dyn ExpiringMap<Token>>,
    /// Per-scope locks serialising "check cache, else exchange"
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenStore {
    pub fn new(client: Client, config: &UpstreamConfig, tokens: Arc<dyn ExpiringMap<Token>>) -> Self {
        Self {
            client,
            auth_url: config.auth_url.clone(),
            service: config.service.clone(),
            credentials: config.auth.clone(),
            timeout: config.timeout(),
            tokens,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Return a valid token for `scope`, exchanging with the auth server on a miss.
    ///
    /// Concurrent callers for the same scope wait on the first one's exchange;
    /// other scopes proceed independently. Failures are never cached.
    pub async fn get_token(&self, scope: &str) -> Result<Token> {
        if let Some(token) = self.tokens.get(scope) {
            tracing::debug!(scope = %scope, "Using cached registry token");
            return Ok(token);
        }

        let scope_lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(scope.to_string()).or_default().clone()
        };
        let _guard = scope_lock.lock().await;

        // Another caller may have completed the exchange while we waited
        if let Some(token) = self.tokens.get(scope) {
            tracing::debug!(scope = %scope, "Using registry token fetched by concurrent request");
            return Ok(token);
        }

        let token = match self.exchange(scope).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(scope = %scope, error = %e, "Failed to fetch registry token");
                return Err(e);
            }
        };
        self.tokens
            .insert(scope.to_string(), token.clone(), token.expires_at());

        tracing::debug!(
            scope = %scope,
            ttl_secs = token.ttl().as_secs(),
            "Fetched registry token"
        );
        Ok(token)
    }

    async fn exchange(&self, scope: &str) -> Result<Token> {
        let mut query = vec![("scope", scope), ("service", self.service.as_str())];
        if let Some(auth) = &self.credentials {
            query.push(("account", auth.username.as_str()));
        }

        let mut request = self
            .client
            .get(&self.auth_url)
            .query(&query)
            .timeout(self.timeout);
        if let Some(auth) = &self.credentials {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MirrorError::Auth(format!(
                "Token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| MirrorError::Auth(format!("Malformed token response: {}", e)))?;

        // Docker Hub uses "token"; some registries only send "access_token"
        let value = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| MirrorError::Auth("Token response contains no token".to_string()))?;

        let ttl = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS));
        let issued_at = match body.issued_at.as_deref() {
            Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(issued) => SystemTime::from(issued),
                Err(e) => {
                    tracing::warn!(
                        scope = %scope,
                        issued_at = %raw,
                        error = %e,
                        "Unparseable issued_at in token response, using local clock"
                    );
                    SystemTime::now()
                }
            },
            None => SystemTime::now(),
        };

        Ok(Token::new(value, scope.to_string(), issued_at, ttl))
    }
}
