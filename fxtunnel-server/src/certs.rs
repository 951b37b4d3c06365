// TLS certificate management
// Holds the base wildcard/apex certificates loaded from disk, an in-memory
// cache of ACME-issued certificates for verified custom domains, and the
// HTTP-01 challenge table served on the plain HTTP port. Issuance during a
// handshake is bounded; the renewal loop runs hourly in the background.

use crate::{ServerError, ServerResult};
use chrono::{Duration as ChronoDuration, Utc};
use fxtunnel_config::{AcmeConfig, ServerConfig};
use fxtunnel_store::{Store, TlsCertRecord};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifetime assumed for freshly issued ACME certificates
const ACME_CERT_DAYS: i64 = 90;

/// Polling budget while an order settles
const ORDER_POLL_ATTEMPTS: usize = 20;

pub struct CertManager {
    base_domain: String,
    public_ip: Option<String>,
    acme: AcmeConfig,
    store: Arc<dyn Store>,
    wildcard: Arc<CertifiedKey>,
    apex: Arc<CertifiedKey>,
    /// Exact-match certificates for verified custom domains
    custom: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// HTTP-01 token -> key authorization, served on the plain HTTP port
    challenges: RwLock<HashMap<String, String>>,
    /// Domains with an issuance in flight
    issuing: RwLock<HashSet<String>>,
    account: OnceCell<Account>,
    resolver: TokioAsyncResolver,
}

impl CertManager {
    /// Load base certificates and build the manager; missing base TLS
    /// material is fatal
    pub fn load(config: &ServerConfig, store: Arc<dyn Store>) -> ServerResult<Arc<CertManager>> {
        let tls = &config.tls;
        let (wildcard_cert, wildcard_key) = match (&tls.wildcard_cert_file, &tls.wildcard_key_file)
        {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(ServerError::ConfigError(
                    "server.tls.wildcard_cert_file and wildcard_key_file must be set".to_string(),
                ))
            }
        };
        let wildcard = Arc::new(load_certified_key(wildcard_cert, wildcard_key)?);
        let apex = match (&tls.apex_cert_file, &tls.apex_key_file) {
            (Some(cert), Some(key)) => Arc::new(load_certified_key(cert, key)?),
            _ => wildcard.clone(),
        };

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        };

        Ok(Arc::new(CertManager {
            base_domain: config.base_domain.to_ascii_lowercase(),
            public_ip: config.public_ip.clone(),
            acme: tls.acme.clone(),
            store,
            wildcard,
            apex,
            custom: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
            issuing: RwLock::new(HashSet::new()),
            account: OnceCell::new(),
            resolver,
        }))
    }

    /// rustls server config for every TLS listener, with SNI dispatch
    pub fn server_tls_config(self: &Arc<Self>) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertResolver(self.clone())));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Synchronous certificate lookup used during the handshake
    pub fn resolve_sni(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        let host = sni.to_ascii_lowercase();
        if let Some(cert) = self.custom.read().unwrap().get(&host) {
            return Some(cert.clone());
        }
        if host == self.base_domain {
            return Some(self.apex.clone());
        }
        if let Some(label) = host.strip_suffix(&format!(".{}", self.base_domain)) {
            // The wildcard covers a single label
            if !label.is_empty() && !label.contains('.') {
                return Some(self.wildcard.clone());
            }
        }
        None
    }

    /// Called with the peeked SNI before the handshake proceeds. For a
    /// verified custom domain with no usable certificate this blocks up
    /// to the configured issuance budget; the handshake fails rather
    /// than stall beyond it.
    pub async fn prepare_sni(&self, sni: &str) {
        let host = sni.to_ascii_lowercase();
        if self.resolve_sni(&host).is_some() {
            return;
        }

        let record = match self.store.get_custom_domain(&host).await {
            Ok(Some(rec)) if rec.verified => rec,
            _ => return,
        };

        // A cached certificate may exist from a previous run
        if let Ok(Some(cached)) = self.store.get_cert(&host).await {
            if cached.expires_at > Utc::now() {
                if let Ok(key) = certified_key_from_pem(&cached.cert_pem, &cached.key_pem) {
                    self.custom.write().unwrap().insert(host.clone(), Arc::new(key));
                    return;
                }
            }
        }

        if !self.acme.enabled {
            debug!(domain = %host, "no certificate and ACME disabled");
            return;
        }

        let budget = Duration::from_secs(self.acme.handshake_timeout_secs);
        match tokio::time::timeout(budget, self.obtain(&record.domain)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(domain = %host, "on-demand issuance failed: {}", e),
            Err(_) => warn!(domain = %host, "on-demand issuance exceeded its budget"),
        }
    }

    /// Obtain (or refresh) a certificate for a verified custom domain
    pub async fn obtain(&self, domain: &str) -> ServerResult<()> {
        let domain = domain.to_ascii_lowercase();
        let already_issuing = {
            let mut issuing = self.issuing.write().unwrap();
            !issuing.insert(domain.clone())
        };
        if already_issuing {
            // Another task is already on it; wait for the cache
            return self.wait_for_issue(&domain).await;
        }
        let result = self.issue(&domain).await;
        self.issuing.write().unwrap().remove(&domain);

        match result {
            Ok(record) => {
                let key = certified_key_from_pem(&record.cert_pem, &record.key_pem)
                    .map_err(|e| ServerError::TlsError(e.to_string()))?;
                self.custom.write().unwrap().insert(domain.clone(), Arc::new(key));
                if let Err(e) = self.store.put_cert(record).await {
                    warn!(domain = %domain, "failed to persist certificate: {}", e);
                }
                info!(domain = %domain, "certificate issued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_issue(&self, domain: &str) -> ServerResult<()> {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if self.custom.read().unwrap().contains_key(domain) {
                return Ok(());
            }
            if !self.issuing.read().unwrap().contains(domain) {
                return Err(ServerError::AcmeError(format!(
                    "issuance for {} did not produce a certificate",
                    domain
                )));
            }
        }
    }

    async fn account(&self) -> ServerResult<&Account> {
        self.account
            .get_or_try_init(|| async {
                let contact: Vec<String> = self
                    .acme
                    .contact_email
                    .iter()
                    .map(|email| format!("mailto:{}", email))
                    .collect();
                let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();
                let (account, _credentials) = Account::create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.acme.directory_url,
                    None,
                )
                .await
                .map_err(|e| ServerError::AcmeError(e.to_string()))?;
                Ok(account)
            })
            .await
    }

    /// Run one HTTP-01 order to completion
    async fn issue(&self, domain: &str) -> ServerResult<TlsCertRecord> {
        let account = self.account().await?;
        let mut order = account
            .new_order(&NewOrder { identifiers: &[Identifier::Dns(domain.to_string())] })
            .await
            .map_err(|e| ServerError::AcmeError(e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| ServerError::AcmeError(e.to_string()))?;

        let mut tokens = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(ServerError::AcmeError(format!(
                        "authorization for {} is {:?}",
                        domain, status
                    )))
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    ServerError::AcmeError(format!("no HTTP-01 challenge offered for {}", domain))
                })?;
            let key_auth = order.key_authorization(challenge);
            self.challenges
                .write()
                .unwrap()
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            tokens.push(challenge.token.clone());
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| ServerError::AcmeError(e.to_string()))?;
        }

        let result = self.settle_order(&mut order, domain).await;

        let mut challenges = self.challenges.write().unwrap();
        for token in tokens {
            challenges.remove(&token);
        }
        drop(challenges);

        result
    }

    async fn settle_order(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> ServerResult<TlsCertRecord> {
        let mut delay = Duration::from_millis(250);
        let mut ready = false;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            let order_state =
                order.refresh().await.map_err(|e| ServerError::AcmeError(e.to_string()))?;
            match order_state.status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    ready = true;
                    break;
                }
                OrderStatus::Invalid => {
                    return Err(ServerError::AcmeError(format!("order for {} is invalid", domain)))
                }
                _ => {}
            }
            delay = (delay * 2).min(Duration::from_secs(2));
        }
        if !ready {
            return Err(ServerError::AcmeError(format!("order for {} never became ready", domain)));
        }

        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr_cert = rcgen::Certificate::from_params(params)
            .map_err(|e| ServerError::TlsError(e.to_string()))?;
        let csr = csr_cert
            .serialize_request_der()
            .map_err(|e| ServerError::TlsError(e.to_string()))?;

        order.finalize(&csr).await.map_err(|e| ServerError::AcmeError(e.to_string()))?;

        let mut delay = Duration::from_millis(250);
        for _ in 0..ORDER_POLL_ATTEMPTS {
            match order.certificate().await {
                Ok(Some(cert_pem)) => {
                    return Ok(TlsCertRecord {
                        domain: domain.to_string(),
                        cert_pem,
                        key_pem: csr_cert.serialize_private_key_pem(),
                        expires_at: Utc::now() + ChronoDuration::days(ACME_CERT_DAYS),
                    })
                }
                Ok(None) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(e) => return Err(ServerError::AcmeError(e.to_string())),
            }
        }
        Err(ServerError::AcmeError(format!("certificate for {} never arrived", domain)))
    }

    /// Serve an HTTP-01 challenge from the plain HTTP listener
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.read().unwrap().get(token).cloned()
    }

    /// Warm the in-memory cache from the store at startup
    pub async fn load_cached_certs(&self) {
        let records = match self.store.list_certs().await {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to list cached certificates: {}", e);
                return;
            }
        };
        let mut loaded = 0;
        for record in records {
            if record.expires_at <= Utc::now() {
                continue;
            }
            match certified_key_from_pem(&record.cert_pem, &record.key_pem) {
                Ok(key) => {
                    self.custom.write().unwrap().insert(record.domain.clone(), Arc::new(key));
                    loaded += 1;
                }
                Err(e) => warn!(domain = %record.domain, "cached certificate unusable: {}", e),
            }
        }
        if loaded > 0 {
            info!(count = loaded, "cached custom-domain certificates loaded");
        }
    }

    /// A custom domain passed verification: start issuance eagerly
    pub fn on_domain_verified(self: &Arc<Self>, domain: String) {
        if !self.acme.enabled {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.obtain(&domain).await {
                warn!(domain = %domain, "eager issuance failed: {}", e);
            }
        });
    }

    /// A custom domain was deleted: forget its certificate
    pub async fn remove_domain(&self, domain: &str) {
        self.custom.write().unwrap().remove(domain);
        if let Err(e) = self.store.delete_cert(domain).await {
            warn!(domain = %domain, "failed to drop cached certificate: {}", e);
        }
    }

    /// Check DNS for a custom domain: CNAME to the target subdomain, or
    /// an A record matching the configured public IP
    pub async fn verify_custom_domain(
        &self,
        domain: &str,
        target_subdomain: &str,
    ) -> ServerResult<bool> {
        let expected_cname = format!("{}.{}", target_subdomain, self.base_domain);

        match self.resolver.lookup(domain, RecordType::CNAME).await {
            Ok(lookup) => {
                for record in lookup.iter() {
                    if let RData::CNAME(name) = record {
                        let target = name.0.to_utf8();
                        if target.trim_end_matches('.').eq_ignore_ascii_case(&expected_cname) {
                            return Ok(true);
                        }
                    }
                }
            }
            Err(e) => {
                if !matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    return Err(ServerError::NetworkError(format!(
                        "CNAME lookup for {} failed: {}",
                        domain, e
                    )));
                }
            }
        }

        if let Some(public_ip) = &self.public_ip {
            match self.resolver.lookup_ip(domain).await {
                Ok(lookup) => {
                    if lookup.iter().any(|ip| ip.to_string() == *public_ip) {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    if !matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                        return Err(ServerError::NetworkError(format!(
                            "A lookup for {} failed: {}",
                            domain, e
                        )));
                    }
                }
            }
        }

        Ok(false)
    }

    /// Hourly renewal loop; certificates within the renewal horizon are
    /// re-issued in the background
    pub async fn run_renewal_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.acme.enabled {
            return;
        }
        let horizon = ChronoDuration::days(self.acme.renew_before_days);
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let records = match self.store.list_certs().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("renewal scan failed: {}", e);
                    continue;
                }
            };
            for record in records {
                if record.expires_at - Utc::now() < horizon {
                    info!(domain = %record.domain, "certificate entering renewal window");
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.obtain(&record.domain).await {
                            warn!(domain = %record.domain, "renewal failed: {}", e);
                        }
                    });
                }
            }
        }
    }
}

struct SniCertResolver(Arc<CertManager>);

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.0.resolve_sni(sni)
    }
}

/// Load a certificate chain and private key from PEM files
pub fn load_certified_key<P: AsRef<Path>>(cert_path: P, key_path: P) -> ServerResult<CertifiedKey> {
    let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
        ServerError::TlsError(format!("{}: {}", cert_path.as_ref().display(), e))
    })?;
    let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
        ServerError::TlsError(format!("{}: {}", key_path.as_ref().display(), e))
    })?;
    certified_key_from_pem(&cert_pem, &key_pem)
}

/// Build a rustls CertifiedKey from PEM text
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> ServerResult<CertifiedKey> {
    let mut cert_reader = std::io::Cursor::new(cert_pem.as_bytes());
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| ServerError::TlsError(format!("bad certificate PEM: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(ServerError::TlsError("no certificates in PEM".to_string()));
    }

    // PKCS#8 first, RSA as fallback
    let mut key_reader = std::io::Cursor::new(key_pem.as_bytes());
    let key = match rustls_pemfile::pkcs8_private_keys(&mut key_reader) {
        Ok(mut keys) if !keys.is_empty() => PrivateKey(keys.remove(0)),
        _ => {
            let mut key_reader = std::io::Cursor::new(key_pem.as_bytes());
            match rustls_pemfile::rsa_private_keys(&mut key_reader) {
                Ok(mut keys) if !keys.is_empty() => PrivateKey(keys.remove(0)),
                _ => return Err(ServerError::TlsError("no private key in PEM".to_string())),
            }
        }
    };

    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| ServerError::TlsError(format!("unsupported key type: {}", e)))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(domain: &str) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn test_certified_key_from_pem() {
        let (cert_pem, key_pem) = self_signed("unit.example.test");
        let key = certified_key_from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_rejects_garbage() {
        assert!(certified_key_from_pem("not a cert", "not a key").is_err());
    }
}
