pub mod gate;
pub mod proxy;
pub mod token;
pub mod upstream;

pub use gate::{ConcurrencyGate, GatePermit};
pub use proxy::{
    normalize_repository, parse_v2_path, FailureKind, FetchBody, FetchResult, RegistryProxy,
    RegistryRequest,
};
pub use token::{ExpiringMap, MemoryExpiringMap, Token, TokenStore};
pub use upstream::{build_http_client, UpstreamClient};
