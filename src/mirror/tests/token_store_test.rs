//! Tests for bearer token acquisition and caching

mod common;

use common::{MockBehavior, MockRegistry};
use futures::future::join_all;
use mirror::config::RegistryAuth;
use mirror::registry::{build_http_client, ExpiringMap, MemoryExpiringMap, Token, TokenStore};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

const NGINX_SCOPE: &str = "repository:library/nginx:pull";

fn store_for(mock: &MockRegistry, auth: Option<RegistryAuth>) -> Arc<TokenStore> {
    let mut config = mock.config(Path::new("unused-cache"));
    config.upstream.auth = auth;
    let client = build_http_client(&config.upstream).unwrap();
    Arc::new(TokenStore::new(
        client,
        &config.upstream,
        Arc::new(MemoryExpiringMap::<Token>::new()),
    ))
}

#[tokio::test]
async fn test_concurrent_requests_share_one_exchange() {
    let mock = MockRegistry::start(MockBehavior {
        token_delay: Duration::from_millis(100),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);

    let callers = (0..10).map(|_| {
        let store = store.clone();
        async move { store.get_token(NGINX_SCOPE).await }
    });
    let tokens = join_all(callers).await;

    assert_eq!(mock.recorded.token_requests(), 1);
    for token in tokens {
        let token = token.unwrap();
        assert_eq!(token.value(), "test-token");
        assert_eq!(token.scope(), NGINX_SCOPE);
    }
}

#[tokio::test]
async fn test_cached_token_is_reused() {
    let mock = MockRegistry::start(MockBehavior::default()).await;
    let store = store_for(&mock, None);

    let first = store.get_token(NGINX_SCOPE).await.unwrap();
    let second = store.get_token(NGINX_SCOPE).await.unwrap();

    assert_eq!(first.value(), second.value());
    assert_eq!(first.ttl(), Duration::from_secs(300));
    assert_eq!(mock.recorded.token_requests(), 1);
}

#[tokio::test]
async fn test_different_scopes_do_not_block_each_other() {
    let mock = MockRegistry::start(MockBehavior {
        token_delay: Duration::from_millis(300),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);

    let started = Instant::now();
    let (nginx, alpine) = tokio::join!(
        store.get_token(NGINX_SCOPE),
        store.get_token("repository:library/alpine:pull"),
    );
    let elapsed = started.elapsed();

    assert!(nginx.is_ok());
    assert!(alpine.is_ok());
    assert_eq!(mock.recorded.token_requests(), 2);
    assert!(
        elapsed < Duration::from_millis(550),
        "exchanges for different scopes ran serially ({:?})",
        elapsed
    );

    let scopes: Vec<String> = mock
        .recorded
        .token_queries
        .lock()
        .unwrap()
        .iter()
        .filter_map(|q| q.get("scope").cloned())
        .collect();
    assert!(scopes.contains(&NGINX_SCOPE.to_string()));
    assert!(scopes.contains(&"repository:library/alpine:pull".to_string()));
}

#[tokio::test]
async fn test_access_token_field_is_accepted() {
    let mock = MockRegistry::start(MockBehavior {
        token_body: r#"{"access_token":"ghcr-token","expires_in":60}"#.to_string(),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);

    let token = store.get_token(NGINX_SCOPE).await.unwrap();
    assert_eq!(token.value(), "ghcr-token");
    assert_eq!(token.ttl(), Duration::from_secs(60));
}

#[tokio::test]
async fn test_response_without_token_is_an_error_and_not_cached() {
    let mock = MockRegistry::start(MockBehavior {
        token_body: r#"{"expires_in":300}"#.to_string(),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);

    assert!(store.get_token(NGINX_SCOPE).await.is_err());
    assert!(store.get_token(NGINX_SCOPE).await.is_err());
    assert_eq!(mock.recorded.token_requests(), 2);
}

#[tokio::test]
async fn test_error_status_and_malformed_json_are_errors() {
    let mock = MockRegistry::start(MockBehavior {
        token_status: StatusCode::INTERNAL_SERVER_ERROR,
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);
    assert!(store.get_token(NGINX_SCOPE).await.is_err());

    let mock = MockRegistry::start(MockBehavior {
        token_body: "not json".to_string(),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);
    assert!(store.get_token(NGINX_SCOPE).await.is_err());
}

#[tokio::test]
async fn test_issued_at_in_the_past_expires_token_immediately() {
    let mock = MockRegistry::start(MockBehavior {
        token_body: r#"{"token":"old-token","expires_in":300,"issued_at":"2000-01-01T00:00:00Z"}"#
            .to_string(),
        ..MockBehavior::default()
    })
    .await;
    let store = store_for(&mock, None);

    let token = store.get_token(NGINX_SCOPE).await.unwrap();
    assert_eq!(token.value(), "old-token");
    assert_eq!(
        token.issued_at(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800)
    );
    assert!(token.is_expired());

    store.get_token(NGINX_SCOPE).await.unwrap();
    assert_eq!(mock.recorded.token_requests(), 2);
}

#[tokio::test]
async fn test_credentials_add_account_and_basic_auth() {
    let mock = MockRegistry::start(MockBehavior::default()).await;
    let store = store_for(
        &mock,
        Some(RegistryAuth {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }),
    );

    store.get_token(NGINX_SCOPE).await.unwrap();

    let query = mock.recorded.token_queries.lock().unwrap()[0].clone();
    assert_eq!(query.get("scope").map(String::as_str), Some(NGINX_SCOPE));
    assert_eq!(query.get("service").map(String::as_str), Some("registry.docker.io"));
    assert_eq!(query.get("account").map(String::as_str), Some("alice"));

    let auth = mock.recorded.token_auth_headers.lock().unwrap()[0].clone();
    assert_eq!(auth.as_deref(), Some("Basic YWxpY2U6c2VjcmV0"));
}

#[tokio::test]
async fn test_anonymous_exchange_sends_no_credentials() {
    let mock = MockRegistry::start(MockBehavior::default()).await;
    let store = store_for(&mock, None);

    store.get_token(NGINX_SCOPE).await.unwrap();

    let query = mock.recorded.token_queries.lock().unwrap()[0].clone();
    assert!(!query.contains_key("account"));
    assert!(mock.recorded.token_auth_headers.lock().unwrap()[0].is_none());
}

#[test]
fn test_memory_map_hides_expired_entries() {
    let map = MemoryExpiringMap::<String>::new();
    map.insert(
        "fresh".to_string(),
        "a".to_string(),
        SystemTime::now() + Duration::from_secs(60),
    );
    map.insert(
        "stale".to_string(),
        "b".to_string(),
        SystemTime::now() - Duration::from_secs(1),
    );

    assert_eq!(map.get("fresh").as_deref(), Some("a"));
    assert_eq!(map.get("stale"), None);
    assert_eq!(map.get("missing"), None);
}

/// Records lookups so tests can see the store consults the injected map
struct CountingMap {
    inner: MemoryExpiringMap<Token>,
    gets: AtomicUsize,
    inserts: AtomicUsize,
}

impl ExpiringMap<Token> for CountingMap {
    fn get(&self, key: &str) -> Option<Token> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn insert(&self, key: String, value: Token, expires_at: SystemTime) {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(key, value, expires_at);
    }
}

#[tokio::test]
async fn test_store_uses_injected_map() {
    let mock = MockRegistry::start(MockBehavior::default()).await;
    let config = mock.config(Path::new("unused-cache"));
    let map = Arc::new(CountingMap {
        inner: MemoryExpiringMap::new(),
        gets: AtomicUsize::new(0),
        inserts: AtomicUsize::new(0),
    });
    let store = TokenStore::new(
        build_http_client(&config.upstream).unwrap(),
        &config.upstream,
        map.clone(),
    );

    store.get_token(NGINX_SCOPE).await.unwrap();
    store.get_token(NGINX_SCOPE).await.unwrap();

    assert_eq!(map.inserts.load(Ordering::SeqCst), 1);
    // miss, re-check under the scope lock, then a hit
    assert_eq!(map.gets.load(Ordering::SeqCst), 3);
    assert_eq!(mock.recorded.token_requests(), 1);
}
