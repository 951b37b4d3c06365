// Persistence contracts for the tunnel runtime
// The runtime's authoritative state is in memory; the store is the durable
// side channel for users, tokens, domain reservations, captured exchanges
// and cached certificates. Any embedded database can implement `Store`;
// the bundled implementation keeps everything in a JSON file.

pub mod file;

pub use file::FileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Store errors
#[derive(Debug)]
pub enum StoreError {
    /// Underlying file or database failure
    Io(String),
    /// Record failed to serialize or parse
    Serialization(String),
    /// Uniqueness constraint violated
    Conflict(String),
    /// Referenced record does not exist
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store I/O error: {}", msg),
            StoreError::Serialization(msg) => write!(f, "store serialization error: {}", msg),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl Error for StoreError {}

/// Store operation result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Hash an API token secret the way the store indexes it
pub fn hash_token(secret: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// An account principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub display_name: String,
    pub is_admin: bool,
    pub plan_id: String,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Quota and feature descriptor; -1 means unlimited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: String,
    pub max_tunnels: i64,
    pub max_subdomains: i64,
    pub max_custom_domains: i64,
    pub inspector_enabled: bool,
}

impl PlanRecord {
    /// Whether `current` more-of-something fits under `limit`
    pub fn allows(limit: i64, current: usize) -> bool {
        limit < 0 || (current as i64) < limit
    }
}

/// An API token; the secret is never stored, only its SHA-256 hex hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    /// Glob patterns of subdomains this token may bind; empty allows all
    #[serde(default)]
    pub allowed_subdomains: Vec<String>,
    /// Client IPs this token may connect from; empty allows all
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Token-level tunnel cap; -1 defers to the plan
    #[serde(default = "default_unlimited")]
    pub max_tunnels: i64,
    pub created_at: DateTime<Utc>,
}

fn default_unlimited() -> i64 {
    -1
}

/// A subdomain reservation, independent of any live tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedSubdomainRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
}

/// A custom apex/subdomain pointed at a reserved subdomain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomainRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub domain: String,
    pub target_subdomain: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A refresh-token session for the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: String,
    pub ip: String,
}

/// One HTTP exchange observed by the interceptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub id: Uuid,
    pub tunnel_id: Uuid,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ns: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub req_headers: Vec<(String, String)>,
    pub resp_headers: Vec<(String, String)>,
    /// Base64 of the captured request body, bounded by config
    pub req_body: String,
    /// Base64 of the captured response body, bounded by config
    pub resp_body: String,
    pub req_truncated: bool,
    pub resp_truncated: bool,
    /// The exchange ended before the full response arrived
    pub error: bool,
    /// Id of the exchange this one replays, if any
    pub replay_ref: Option<Uuid>,
}

impl CapturedExchange {
    pub fn req_body_bytes(&self) -> Vec<u8> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.req_body)
            .unwrap_or_default()
    }

    pub fn resp_body_bytes(&self) -> Vec<u8> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.resp_body)
            .unwrap_or_default()
    }
}

/// A cached TLS certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertRecord {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// Durable storage contract consumed by the tunnel runtime
#[async_trait]
pub trait Store: Send + Sync {
    // Users and plans
    async fn get_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;
    async fn put_user(&self, user: UserRecord) -> StoreResult<()>;
    async fn get_plan(&self, id: &str) -> StoreResult<Option<PlanRecord>>;
    async fn put_plan(&self, plan: PlanRecord) -> StoreResult<()>;

    // API tokens
    async fn find_token_by_hash(&self, hash: &str) -> StoreResult<Option<ApiTokenRecord>>;
    async fn put_token(&self, token: ApiTokenRecord) -> StoreResult<()>;
    async fn delete_token(&self, id: Uuid) -> StoreResult<bool>;
    async fn count_tokens(&self) -> StoreResult<usize>;

    // Reserved subdomains (unique on subdomain)
    async fn get_reserved_subdomain(
        &self,
        subdomain: &str,
    ) -> StoreResult<Option<ReservedSubdomainRecord>>;
    async fn list_reserved_subdomains(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<ReservedSubdomainRecord>>;
    async fn put_reserved_subdomain(&self, rec: ReservedSubdomainRecord) -> StoreResult<()>;
    async fn delete_reserved_subdomain(&self, user_id: Uuid, subdomain: &str)
        -> StoreResult<bool>;

    // Custom domains (unique on domain)
    async fn get_custom_domain(&self, domain: &str) -> StoreResult<Option<CustomDomainRecord>>;
    async fn list_custom_domains(&self, user_id: Uuid) -> StoreResult<Vec<CustomDomainRecord>>;
    async fn put_custom_domain(&self, rec: CustomDomainRecord) -> StoreResult<()>;
    async fn update_custom_domain(&self, rec: CustomDomainRecord) -> StoreResult<()>;
    async fn delete_custom_domain(&self, user_id: Uuid, domain: &str) -> StoreResult<bool>;
    async fn list_all_custom_domains(&self) -> StoreResult<Vec<CustomDomainRecord>>;

    // Captured exchange journal
    async fn append_exchange(&self, exchange: CapturedExchange) -> StoreResult<()>;
    async fn get_exchange(&self, id: Uuid) -> StoreResult<Option<CapturedExchange>>;
    async fn list_exchanges(
        &self,
        tunnel_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<CapturedExchange>>;
    async fn clear_exchanges(&self, tunnel_id: Uuid) -> StoreResult<()>;

    // TLS certificate cache
    async fn get_cert(&self, domain: &str) -> StoreResult<Option<TlsCertRecord>>;
    async fn put_cert(&self, rec: TlsCertRecord) -> StoreResult<()>;
    async fn delete_cert(&self, domain: &str) -> StoreResult<bool>;
    async fn list_certs(&self) -> StoreResult<Vec<TlsCertRecord>>;

    // REST API refresh sessions
    async fn put_api_session(&self, rec: ApiSessionRecord) -> StoreResult<()>;
    async fn find_api_session_by_hash(
        &self,
        hash: &str,
    ) -> StoreResult<Option<ApiSessionRecord>>;
    async fn delete_api_session(&self, id: Uuid) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_sha256_hex() {
        let hash = hash_token("sk_fxtunnel_a1b2");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls
        assert_eq!(hash, hash_token("sk_fxtunnel_a1b2"));
        assert_ne!(hash, hash_token("sk_fxtunnel_a1b3"));
    }

    #[test]
    fn test_plan_allows_unlimited() {
        assert!(PlanRecord::allows(-1, 10_000));
        assert!(PlanRecord::allows(3, 2));
        assert!(!PlanRecord::allows(3, 3));
        assert!(!PlanRecord::allows(0, 0));
    }
}
