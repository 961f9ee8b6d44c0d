use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use rcgen::CertificateParams;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AcmeConfig;
use crate::ports::certificates::{CertificateObtainer, ObtainError};

/// Domain-validated certificate acquisition over the HTTP-01 flow.
///
/// Issued certificates are cached twice: an in-memory map serving the TLS
/// handshake path, and a PEM pair per domain under the configured cache
/// directory so reissue is not needed across restarts. Issuance is limited
/// to hostnames enumerated from the backend directory at startup.
pub struct AcmeObtainer {
    config: AcmeConfig,
    allowed_hosts: Vec<String>,
    cache: DashMap<String, Arc<CertifiedKey>>,
    challenges: DashMap<String, String>,
    account: TokioMutex<Option<Arc<Account>>>,
    issue_lock: TokioMutex<()>,
}

impl AcmeObtainer {
    pub fn new(config: AcmeConfig, allowed_hosts: Vec<String>) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!(
                "failed to create certificate cache directory: {:?}",
                config.cache_dir
            )
        })?;

        Ok(Self {
            config,
            allowed_hosts,
            cache: DashMap::new(),
            challenges: DashMap::new(),
            account: TokioMutex::new(None),
            issue_lock: TokioMutex::new(()),
        })
    }

    /// Certificate and key paths for a domain in the on-disk cache.
    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let cert_path = self.config.cache_dir.join(format!("{domain}.crt"));
        let key_path = self.config.cache_dir.join(format!("{domain}.key"));
        (cert_path, key_path)
    }

    /// Load a previously issued certificate from disk, if present and
    /// parseable. An unusable cache entry is logged and treated as absent.
    fn load_cached(&self, domain: &str) -> Option<CertifiedKey> {
        let (cert_path, key_path) = self.cert_paths(domain);
        if !cert_path.exists() || !key_path.exists() {
            return None;
        }

        let cert_pem = match fs::read(&cert_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(hostname = %domain, error = %err, "failed to read cached certificate");
                return None;
            }
        };
        let key_pem = match fs::read(&key_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(hostname = %domain, error = %err, "failed to read cached private key");
                return None;
            }
        };

        match certified_key_from_pem(&cert_pem, &key_pem) {
            Ok(cert) => {
                info!(hostname = %domain, "loaded certificate from cache");
                Some(cert)
            }
            Err(err) => {
                warn!(hostname = %domain, error = %err, "cached certificate unusable, will reissue");
                None
            }
        }
    }

    /// The shared CA account, registered on first use.
    async fn account(&self) -> Result<Arc<Account>> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let contact_line = self
            .config
            .contact_email
            .as_ref()
            .map(|email| format!("mailto:{email}"));
        let contact: Vec<&str> = contact_line.as_deref().into_iter().collect();

        info!(
            directory_url = %self.config.directory_url,
            "registering account with the certificate authority"
        );
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.config.directory_url,
            None,
        )
        .await
        .context("failed to create certificate authority account")?;

        let account = Arc::new(account);
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn obtain_async(&self, domain: &str) -> Result<Arc<CertifiedKey>, ObtainError> {
        let _issuing = self.issue_lock.lock().await;

        // Another handshake may have finished issuance while we waited
        if let Some(cert) = self.cache.get(domain) {
            return Ok(cert.value().clone());
        }

        if let Some(cert) = self.load_cached(domain) {
            let cert = Arc::new(cert);
            self.cache.insert(domain.to_string(), cert.clone());
            return Ok(cert);
        }

        let cert = self
            .request_certificate(domain)
            .await
            .map_err(|err| ObtainError::Issuance(format!("{err:#}")))?;
        let cert = Arc::new(cert);
        self.cache.insert(domain.to_string(), cert.clone());
        Ok(cert)
    }

    /// Run the full issuance flow for one domain: order, HTTP-01 challenge,
    /// CSR, download, persist.
    async fn request_certificate(&self, domain: &str) -> Result<CertifiedKey> {
        info!(hostname = %domain, "requesting certificate");

        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;

        let authorizations = order
            .authorizations()
            .await
            .context("failed to get authorizations")?;

        for authorization in &authorizations {
            if authorization.status == AuthorizationStatus::Valid {
                info!(identifier = ?authorization.identifier, "authorization already valid");
                continue;
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("no HTTP-01 challenge offered for {domain}"))?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges.insert(
                challenge.token.clone(),
                key_authorization.as_str().to_string(),
            );
            info!(hostname = %domain, token = %challenge.token, "published HTTP challenge");

            let outcome = match order.set_challenge_ready(&challenge.url).await {
                Ok(()) => {
                    self.await_authorization(&mut order, &authorization.identifier)
                        .await
                }
                Err(err) => Err(anyhow!(err).context("failed to mark challenge ready")),
            };

            // The token is only served while its authorization is in flight
            self.challenges.remove(&challenge.token);
            outcome?;
        }

        let params = CertificateParams::new(vec![domain.to_string()])
            .context("invalid certificate parameters")?;
        let key_pair = rcgen::KeyPair::generate().context("failed to generate certificate key")?;
        let csr = params
            .serialize_request(&key_pair)
            .context("failed to serialize certificate request")?;

        order
            .finalize(csr.der())
            .await
            .context("failed to finalize order")?;

        let cert_chain = self.await_certificate(&mut order).await?;

        let (cert_path, key_path) = self.cert_paths(domain);
        fs::write(&cert_path, &cert_chain).context("failed to save certificate")?;
        fs::write(&key_path, key_pair.serialize_pem()).context("failed to save private key")?;
        info!(hostname = %domain, cert = %cert_path.display(), "certificate issued and cached");

        certified_key_from_pem(cert_chain.as_bytes(), key_pair.serialize_pem().as_bytes())
    }

    /// Poll until the authorization leaves the pending state.
    async fn await_authorization(&self, order: &mut Order, identifier: &Identifier) -> Result<()> {
        let mut attempts = 0;
        loop {
            sleep(Duration::from_secs(2)).await;
            attempts += 1;

            let authorizations = order
                .authorizations()
                .await
                .context("failed to refresh authorizations")?;

            let authorization = authorizations
                .iter()
                .find(|auth| auth.identifier == *identifier)
                .ok_or_else(|| anyhow!("authorization not found for {identifier:?}"))?;

            match authorization.status {
                AuthorizationStatus::Valid => {
                    info!(identifier = ?identifier, "challenge validated");
                    return Ok(());
                }
                AuthorizationStatus::Invalid => {
                    return Err(anyhow!("challenge validation failed for {identifier:?}"));
                }
                _ => {
                    if attempts > 30 {
                        return Err(anyhow!("challenge validation timed out for {identifier:?}"));
                    }
                }
            }
        }
    }

    /// Poll until the finalized order yields a certificate chain.
    async fn await_certificate(&self, order: &mut Order) -> Result<String> {
        let mut attempts = 0;
        loop {
            sleep(Duration::from_secs(2)).await;
            attempts += 1;

            order
                .refresh()
                .await
                .context("failed to refresh order state")?;
            let status = order.state().status;

            match status {
                OrderStatus::Valid => {
                    return order
                        .certificate()
                        .await
                        .context("failed to download certificate")?
                        .ok_or_else(|| anyhow!("order is valid but no certificate is available"));
                }
                OrderStatus::Invalid => {
                    return Err(anyhow!("order became invalid"));
                }
                _ => {
                    if attempts > 30 {
                        return Err(anyhow!("certificate issuance timed out"));
                    }
                }
            }
        }
    }
}

impl CertificateObtainer for AcmeObtainer {
    fn obtain(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ObtainError> {
        if let Some(cert) = self.cache.get(server_name) {
            return Ok(cert.value().clone());
        }

        if !self.allowed_hosts.iter().any(|host| host == server_name) {
            return Err(ObtainError::NotAllowed(server_name.to_string()));
        }

        // rustls resolves certificates synchronously; hop onto the runtime
        // for the cache/issuance flow (requires the multi-thread runtime)
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.obtain_async(server_name))
        })
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|entry| entry.value().clone())
    }
}

/// Assemble a rustls `CertifiedKey` from a PEM certificate chain and key.
fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in PEM"));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("failed to parse private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM"))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .context("unsupported private key type")?;

    Ok(CertifiedKey::new(certs, signing_key))
}
