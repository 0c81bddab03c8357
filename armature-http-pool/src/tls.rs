//! TLS trust material for outbound connections.
//!
//! [`TrustFactory::build`] turns a [`TrustMaterial`] into an immutable
//! [`TlsContext`]: a rustls client configuration carrying the trust store,
//! the optional client identity, and the hostname policy. The context is built
//! once at initialization and shared read-only by every pooled connection.
//!
//! Certificate chains are always validated against the trust store. Only the
//! hostname check is governed by [`VerificationMode`]; `Disabled` accepts any
//! hostname and is logged as insecure.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::{BTreeMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{TrustMaterial, VerificationMode};
use crate::{HttpPoolError, Result};

/// Accepted server identities.
#[derive(Debug, Clone)]
pub enum HostnameVerifier {
    /// Accept any hostname.
    Disabled,
    /// Accept only the listed hostnames (stored lower-cased).
    AllowList(Arc<HashSet<String>>),
}

impl HostnameVerifier {
    /// Build the verifier described by the trust material.
    pub fn from_trust_material(material: &TrustMaterial) -> Self {
        match material.verification_mode() {
            VerificationMode::Disabled => Self::Disabled,
            VerificationMode::AllowList => Self::allow_list(
                material.trusted_hosts.iter().flatten().map(String::as_str),
            ),
        }
    }

    /// Allow-list verifier over the given hosts.
    pub fn allow_list<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self::AllowList(Arc::new(hosts))
    }

    /// Mode this verifier implements.
    pub fn mode(&self) -> VerificationMode {
        match self {
            Self::Disabled => VerificationMode::Disabled,
            Self::AllowList(_) => VerificationMode::AllowList,
        }
    }

    /// Check a presented hostname. Exact, case-insensitive membership.
    pub fn verify(&self, host: &str) -> bool {
        match self {
            Self::Disabled => true,
            Self::AllowList(hosts) => hosts.contains(&host.trim_end_matches('.').to_ascii_lowercase()),
        }
    }
}

/// Trusted certificates: the bundled roots plus every certificate loaded from disk.
#[derive(Debug, Clone)]
pub struct TrustStore {
    roots: RootCertStore,
    entries: BTreeMap<PathBuf, Vec<CertificateDer<'static>>>,
}

impl TrustStore {
    /// Trust store holding only the bundled Mozilla root set.
    pub fn system_default() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            roots,
            entries: BTreeMap::new(),
        }
    }

    /// Default roots plus every certificate file found under `dir`.
    ///
    /// Any unreadable or malformed file fails the whole load; a partially
    /// populated store is never returned.
    pub fn load_directory(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(HttpPoolError::TrustMaterial(format!(
                "trusted certificate path {} does not exist",
                dir.display()
            )));
        }

        let mut store = Self::system_default();
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                HttpPoolError::TrustMaterial(format!("failed to walk {}: {e}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            store.add_file(entry.path())?;
        }

        info!(
            path = %dir.display(),
            files = store.entries.len(),
            certificates = store.custom_certificate_count(),
            "Loaded trusted certificates"
        );
        Ok(store)
    }

    fn add_file(&mut self, path: &Path) -> Result<()> {
        let certs = read_certificates(path)?;
        for cert in &certs {
            self.roots.add(cert.clone()).map_err(|e| {
                HttpPoolError::TrustMaterial(format!(
                    "invalid certificate in {}: {e}",
                    path.display()
                ))
            })?;
        }
        debug!(path = %path.display(), count = certs.len(), "Trusted certificate file");
        self.entries.insert(path.to_path_buf(), certs);
        Ok(())
    }

    /// Root store handed to the verifier.
    pub fn roots(&self) -> &RootCertStore {
        &self.roots
    }

    /// Certificates loaded from disk, keyed by file path.
    pub fn entries(&self) -> &BTreeMap<PathBuf, Vec<CertificateDer<'static>>> {
        &self.entries
    }

    /// Number of certificates loaded from disk.
    pub fn custom_certificate_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Read one certificate file, PEM (one or more blocks) or a single DER certificate.
fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path).map_err(|e| {
        HttpPoolError::TrustMaterial(format!("failed to read {}: {e}", path.display()))
    })?;

    if !bytes.windows(10).any(|w| w == b"-----BEGIN") {
        if bytes.is_empty() {
            return Err(HttpPoolError::TrustMaterial(format!(
                "certificate file {} is empty",
                path.display()
            )));
        }
        return Ok(vec![CertificateDer::from(bytes)]);
    }

    let mut reader = BufReader::new(bytes.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            HttpPoolError::TrustMaterial(format!(
                "failed to parse certificates in {}: {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(HttpPoolError::TrustMaterial(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Client identity loaded from a PKCS#12 key store.
#[derive(Debug)]
pub struct KeyMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl KeyMaterial {
    /// Load the first private key and its certificates from a PKCS#12 file.
    pub fn load_pkcs12(path: &Path, password: &str) -> Result<Self> {
        let der = std::fs::read(path).map_err(|e| {
            HttpPoolError::KeyMaterial(format!("failed to read key store {}: {e}", path.display()))
        })?;
        let pfx = p12::PFX::parse(&der).map_err(|e| {
            HttpPoolError::KeyMaterial(format!("invalid key store {}: {e:?}", path.display()))
        })?;
        if !pfx.verify_mac(password) {
            return Err(HttpPoolError::KeyMaterial(format!(
                "wrong password for key store {}",
                path.display()
            )));
        }

        let key = pfx
            .key_bags(password)
            .map_err(|e| HttpPoolError::KeyMaterial(format!("failed to decrypt private key: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                HttpPoolError::KeyMaterial(format!("no private key in {}", path.display()))
            })?;
        let chain: Vec<CertificateDer<'static>> = pfx
            .cert_x509_bags(password)
            .map_err(|e| HttpPoolError::KeyMaterial(format!("failed to read certificates: {e:?}")))?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        if chain.is_empty() {
            return Err(HttpPoolError::KeyMaterial(format!(
                "no certificate in {}",
                path.display()
            )));
        }

        Ok(Self {
            chain,
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
        })
    }

    /// Certificate chain presented to servers.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

/// Immutable TLS state shared by all pooled connections.
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    trust: Arc<TrustStore>,
    hostnames: HostnameVerifier,
    client_identity: bool,
}

impl TlsContext {
    /// rustls client configuration for new connections.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Trust store in use.
    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Hostname policy in use.
    pub fn hostname_verifier(&self) -> &HostnameVerifier {
        &self.hostnames
    }

    /// Whether a client certificate is presented.
    pub fn has_client_identity(&self) -> bool {
        self.client_identity
    }
}

/// Builds [`TlsContext`]s from configuration.
pub struct TrustFactory;

impl TrustFactory {
    /// Build the TLS context and hostname verifier for `material`.
    pub fn build(material: &TrustMaterial) -> Result<(TlsContext, HostnameVerifier)> {
        material.validate()?;

        let key = match (&material.private_key_path, &material.private_key_password) {
            (Some(path), Some(password)) => Some(KeyMaterial::load_pkcs12(path, password)?),
            _ => None,
        };

        let trust = match &material.trusted_certs_path {
            Some(path) => TrustStore::load_directory(path)?,
            None => TrustStore::system_default(),
        };

        let hostnames = HostnameVerifier::from_trust_material(material);
        if hostnames.mode() == VerificationMode::Disabled {
            warn!("Hostname verification is disabled; any server hostname will be accepted");
        }

        let trust = Arc::new(trust);
        let config = client_config(&trust, &hostnames, key)?;
        let context = TlsContext {
            config: Arc::new(config),
            trust,
            hostnames: hostnames.clone(),
            client_identity: material.private_key_path.is_some(),
        };
        Ok((context, hostnames))
    }
}

fn client_config(
    trust: &TrustStore,
    hostnames: &HostnameVerifier,
    key: Option<KeyMaterial>,
) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(TrustedServerVerifier {
        roots: Arc::new(trust.roots().clone()),
        hostnames: hostnames.clone(),
        provider: Arc::clone(&provider),
    });

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpPoolError::Configuration(format!("unsupported TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let mut config = match key {
        Some(key) => builder
            .with_client_auth_cert(key.chain, key.key)
            .map_err(|e| HttpPoolError::KeyMaterial(format!("unusable client identity: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Chain validation against the trust store followed by the hostname policy.
#[derive(Debug)]
struct TrustedServerVerifier {
    roots: Arc<RootCertStore>,
    hostnames: HostnameVerifier,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        let host = server_name_str(server_name);
        if !self.hostnames.verify(&host) {
            warn!(host = %host, "Server hostname is not in the trusted host list");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn server_name_str(name: &ServerName<'_>) -> String {
    match name {
        ServerName::DnsName(dns) => dns.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        other => format!("{other:?}"),
    }
}
