// JSON-file-backed store
// All records live in one serde document guarded by an RwLock; mutations
// rewrite the file. Good for a single-process server; swap in an SQL
// implementation of `Store` for anything bigger.

use crate::{
    ApiSessionRecord, ApiTokenRecord, CapturedExchange, CustomDomainRecord, PlanRecord,
    ReservedSubdomainRecord, Store, StoreError, StoreResult, TlsCertRecord, UserRecord,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Exchanges journaled per tunnel before the oldest are dropped
const JOURNAL_LIMIT_PER_TUNNEL: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreData {
    users: HashMap<Uuid, UserRecord>,
    plans: HashMap<String, PlanRecord>,
    tokens: HashMap<Uuid, ApiTokenRecord>,
    reserved_subdomains: HashMap<String, ReservedSubdomainRecord>,
    custom_domains: HashMap<String, CustomDomainRecord>,
    api_sessions: HashMap<Uuid, ApiSessionRecord>,
    /// Journal, newest last, bounded per tunnel
    exchanges: Vec<CapturedExchange>,
    certs: HashMap<String, TlsCertRecord>,
}

/// File-backed store implementation
pub struct FileStore {
    data: RwLock<StoreData>,
    path: PathBuf,
}

impl FileStore {
    /// Open the store, loading the file when it exists
    pub async fn open(path: PathBuf) -> StoreResult<FileStore> {
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str(&content)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Io(format!("{}: {}", parent.display(), e)))?;
            }
            StoreData::default()
        };
        info!(path = %path.display(), "store opened");
        Ok(FileStore { data: RwLock::new(data), path })
    }

    async fn save(&self) -> StoreResult<()> {
        let content = {
            let data = self.data.read().await;
            serde_json::to_string(&*data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        fs::write(&self.path, content)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.data.read().await.users.get(&id).cloned())
    }

    async fn put_user(&self, user: UserRecord) -> StoreResult<()> {
        self.data.write().await.users.insert(user.id, user);
        self.save().await
    }

    async fn get_plan(&self, id: &str) -> StoreResult<Option<PlanRecord>> {
        Ok(self.data.read().await.plans.get(id).cloned())
    }

    async fn put_plan(&self, plan: PlanRecord) -> StoreResult<()> {
        self.data.write().await.plans.insert(plan.id.clone(), plan);
        self.save().await
    }

    async fn find_token_by_hash(&self, hash: &str) -> StoreResult<Option<ApiTokenRecord>> {
        Ok(self
            .data
            .read()
            .await
            .tokens
            .values()
            .find(|t| t.token_hash == hash)
            .cloned())
    }

    async fn put_token(&self, token: ApiTokenRecord) -> StoreResult<()> {
        self.data.write().await.tokens.insert(token.id, token);
        self.save().await
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self.data.write().await.tokens.remove(&id).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn count_tokens(&self) -> StoreResult<usize> {
        Ok(self.data.read().await.tokens.len())
    }

    async fn get_reserved_subdomain(
        &self,
        subdomain: &str,
    ) -> StoreResult<Option<ReservedSubdomainRecord>> {
        Ok(self.data.read().await.reserved_subdomains.get(subdomain).cloned())
    }

    async fn list_reserved_subdomains(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<ReservedSubdomainRecord>> {
        let mut list: Vec<ReservedSubdomainRecord> = self
            .data
            .read()
            .await
            .reserved_subdomains
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.created_at);
        Ok(list)
    }

    async fn put_reserved_subdomain(&self, rec: ReservedSubdomainRecord) -> StoreResult<()> {
        {
            let mut data = self.data.write().await;
            if data.reserved_subdomains.contains_key(&rec.subdomain) {
                return Err(StoreError::Conflict(format!(
                    "subdomain '{}' is already reserved",
                    rec.subdomain
                )));
            }
            data.reserved_subdomains.insert(rec.subdomain.clone(), rec);
        }
        self.save().await
    }

    async fn delete_reserved_subdomain(
        &self,
        user_id: Uuid,
        subdomain: &str,
    ) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write().await;
            match data.reserved_subdomains.get(subdomain) {
                Some(rec) if rec.user_id == user_id => {
                    data.reserved_subdomains.remove(subdomain);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn get_custom_domain(&self, domain: &str) -> StoreResult<Option<CustomDomainRecord>> {
        Ok(self.data.read().await.custom_domains.get(domain).cloned())
    }

    async fn list_custom_domains(&self, user_id: Uuid) -> StoreResult<Vec<CustomDomainRecord>> {
        let mut list: Vec<CustomDomainRecord> = self
            .data
            .read()
            .await
            .custom_domains
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.created_at);
        Ok(list)
    }

    async fn put_custom_domain(&self, rec: CustomDomainRecord) -> StoreResult<()> {
        {
            let mut data = self.data.write().await;
            if data.custom_domains.contains_key(&rec.domain) {
                return Err(StoreError::Conflict(format!(
                    "domain '{}' is already registered",
                    rec.domain
                )));
            }
            data.custom_domains.insert(rec.domain.clone(), rec);
        }
        self.save().await
    }

    async fn update_custom_domain(&self, rec: CustomDomainRecord) -> StoreResult<()> {
        {
            let mut data = self.data.write().await;
            if !data.custom_domains.contains_key(&rec.domain) {
                return Err(StoreError::NotFound(format!("domain '{}'", rec.domain)));
            }
            data.custom_domains.insert(rec.domain.clone(), rec);
        }
        self.save().await
    }

    async fn delete_custom_domain(&self, user_id: Uuid, domain: &str) -> StoreResult<bool> {
        let removed = {
            let mut data = self.data.write().await;
            match data.custom_domains.get(domain) {
                Some(rec) if rec.user_id == user_id => {
                    data.custom_domains.remove(domain);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn list_all_custom_domains(&self) -> StoreResult<Vec<CustomDomainRecord>> {
        Ok(self.data.read().await.custom_domains.values().cloned().collect())
    }

    async fn append_exchange(&self, exchange: CapturedExchange) -> StoreResult<()> {
        {
            let mut data = self.data.write().await;
            let tunnel_id = exchange.tunnel_id;
            data.exchanges.push(exchange);
            let count = data.exchanges.iter().filter(|e| e.tunnel_id == tunnel_id).count();
            if count > JOURNAL_LIMIT_PER_TUNNEL {
                // Drop the oldest entries for this tunnel
                let mut excess = count - JOURNAL_LIMIT_PER_TUNNEL;
                data.exchanges.retain(|e| {
                    if excess > 0 && e.tunnel_id == tunnel_id {
                        excess -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }
        self.save().await
    }

    async fn get_exchange(&self, id: Uuid) -> StoreResult<Option<CapturedExchange>> {
        Ok(self.data.read().await.exchanges.iter().find(|e| e.id == id).cloned())
    }

    async fn list_exchanges(
        &self,
        tunnel_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<CapturedExchange>> {
        let data = self.data.read().await;
        Ok(data
            .exchanges
            .iter()
            .rev()
            .filter(|e| e.tunnel_id == tunnel_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear_exchanges(&self, tunnel_id: Uuid) -> StoreResult<()> {
        self.data.write().await.exchanges.retain(|e| e.tunnel_id != tunnel_id);
        self.save().await
    }

    async fn get_cert(&self, domain: &str) -> StoreResult<Option<TlsCertRecord>> {
        Ok(self.data.read().await.certs.get(domain).cloned())
    }

    async fn put_cert(&self, rec: TlsCertRecord) -> StoreResult<()> {
        self.data.write().await.certs.insert(rec.domain.clone(), rec);
        self.save().await
    }

    async fn delete_cert(&self, domain: &str) -> StoreResult<bool> {
        let removed = self.data.write().await.certs.remove(domain).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn list_certs(&self) -> StoreResult<Vec<TlsCertRecord>> {
        Ok(self.data.read().await.certs.values().cloned().collect())
    }

    async fn put_api_session(&self, rec: ApiSessionRecord) -> StoreResult<()> {
        self.data.write().await.api_sessions.insert(rec.id, rec);
        self.save().await
    }

    async fn find_api_session_by_hash(
        &self,
        hash: &str,
    ) -> StoreResult<Option<ApiSessionRecord>> {
        Ok(self
            .data
            .read()
            .await
            .api_sessions
            .values()
            .find(|s| s.refresh_token_hash == hash)
            .cloned())
    }

    async fn delete_api_session(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self.data.write().await.api_sessions.remove(&id).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }
}
