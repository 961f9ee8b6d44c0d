use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::ports::certificates::CertificateObtainer;

/// Server names answered with the process-lifetime self-signed certificate
/// instead of consulting the obtainer.
const LOCAL_NAMES: &[&str] = &["localhost", "127.0.0.1"];

/// Per-handshake certificate selection.
///
/// Decides, for each TLS ClientHello, which certificate to present:
/// the local self-signed certificate for loopback/testing names, an issued
/// certificate from the obtainer for everything else, and the self-signed
/// certificate again as the fallback whenever the SNI name is absent or the
/// obtainer fails. Resolution never aborts a handshake: refusing to complete
/// one would reset the connection with no diagnostic for the client, so an
/// invalid-but-presentable certificate wins over no certificate.
pub struct CertResolver {
    obtainer: Arc<dyn CertificateObtainer>,
    self_signed: Arc<CertifiedKey>,
}

impl CertResolver {
    /// Build a resolver around the given obtainer, generating the
    /// process-lifetime self-signed certificate.
    ///
    /// The self-signed certificate covers `localhost`, `127.0.0.1` and
    /// `::1`. It is never exposed to external validation, so it is generated
    /// once here and reused for the life of the process.
    pub fn new(obtainer: Arc<dyn CertificateObtainer>) -> Result<Self> {
        let self_signed = Arc::new(generate_self_signed()?);
        Ok(Self {
            obtainer,
            self_signed,
        })
    }

    /// The self-signed certificate used for local names and as fallback.
    pub fn self_signed(&self) -> Arc<CertifiedKey> {
        self.self_signed.clone()
    }

    /// The certificate decision itself, keyed by the (possibly absent) SNI
    /// name. Infallible: every input maps to some presentable certificate.
    pub fn certificate_for(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = server_name else {
            tracing::debug!(stage = "resolve", outcome = "fallback", "handshake without SNI");
            return self.self_signed.clone();
        };

        if LOCAL_NAMES.contains(&name) {
            tracing::debug!(
                hostname = %name,
                stage = "resolve",
                outcome = "local",
                "presenting self-signed certificate"
            );
            return self.self_signed.clone();
        }

        match self.obtainer.obtain(name) {
            Ok(cert) => {
                tracing::debug!(hostname = %name, stage = "resolve", outcome = "issued", "certificate resolved");
                cert
            }
            Err(err) => {
                tracing::warn!(
                    hostname = %name,
                    stage = "resolve",
                    outcome = "fallback",
                    error = %err,
                    "certificate unavailable, presenting self-signed fallback"
                );
                self.self_signed.clone()
            }
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certificate_for(client_hello.server_name()))
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

/// Generate the self-signed certificate once, at construction time.
fn generate_self_signed() -> Result<CertifiedKey> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("invalid self-signed certificate parameters")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Test");

    let key_pair = KeyPair::generate().context("failed to generate self-signed key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign localhost certificate")?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
        .context("self-signed key rejected by TLS provider")?;

    Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
}
