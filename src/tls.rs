use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::Error;

/// TLS material for one side of a proxy. Building yields `None` when
/// nothing is configured, so callers can treat "no TLS" and "TLS" through
/// one path.
///
/// rustls does not implement renegotiation, so no knob for disabling it
/// exists or is needed.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_files: Vec<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Accept only client certificates whose SAN carries one of these DNS
    /// names. Implies required client auth.
    pub allowed_dns_names: Vec<String>,
}

impl TlsSettings {
    pub fn is_set(&self) -> bool {
        !self.ca_files.is_empty() || self.cert_file.is_some() || self.key_file.is_some()
    }

    /// Outbound configuration. Roots come from the CA bundle when given,
    /// otherwise from the webpki bundled roots; a cert/key pair becomes the
    /// client identity.
    pub fn client_config(&self) -> Result<Option<Arc<ClientConfig>>, Error> {
        if !self.is_set() {
            return Ok(None);
        }

        let mut roots = RootCertStore::empty();
        if self.ca_files.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            add_ca_bundle(&mut roots, &self.ca_files)?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| Error::config(format!("client keypair: {e}")))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Some(Arc::new(config)))
    }

    /// Listening configuration. A CA bundle turns on required client auth;
    /// a DNS-name allow-list further restricts which verified clients are
    /// let through.
    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, Error> {
        if !self.is_set() {
            return Ok(None);
        }

        let (cert_file, key_file) = match (&self.cert_file, &self.key_file) {
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(Error::config(
                    "listening with TLS requires both cert-file and key-file",
                ))
            }
        };

        let builder = if self.ca_files.is_empty() {
            if !self.allowed_dns_names.is_empty() {
                return Err(Error::config(
                    "allowed-dns-name requires a client CA bundle",
                ));
            }
            ServerConfig::builder().with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            add_ca_bundle(&mut roots, &self.ca_files)?;
            let webpki = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::config(format!("client verifier: {e}")))?;
            let verifier: Arc<dyn ClientCertVerifier> = if self.allowed_dns_names.is_empty() {
                webpki
            } else {
                Arc::new(AllowedDnsNamesVerifier {
                    inner: webpki,
                    allowed: self.allowed_dns_names.clone(),
                })
            };
            ServerConfig::builder().with_client_cert_verifier(verifier)
        };

        let config = builder
            .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| Error::config(format!("server keypair: {e}")))?;
        Ok(Some(Arc::new(config)))
    }

    /// Re-serializes the settings as argv fragments for a re-invoked child,
    /// e.g. `--listen.tls.ca-file=...`.
    pub fn to_args(&self, group: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(cert) = &self.cert_file {
            args.push(format!("--{group}.cert-file={}", cert.display()));
        }
        if let Some(key) = &self.key_file {
            args.push(format!("--{group}.key-file={}", key.display()));
        }
        for ca in &self.ca_files {
            args.push(format!("--{group}.ca-file={}", ca.display()));
        }
        for name in &self.allowed_dns_names {
            args.push(format!("--{group}.allowed-dns-name={name}"));
        }
        args
    }
}

fn add_ca_bundle(roots: &mut RootCertStore, files: &[PathBuf]) -> Result<(), Error> {
    for path in files {
        let certs = load_certs(path)?;
        if certs.is_empty() {
            return Err(Error::config(format!(
                "could not parse any PEM certificates in {}",
                path.display()
            )));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| Error::config(format!("bad CA in {}: {e}", path.display())))?;
        }
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("could not read certificate {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("could not parse {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("could not read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::config(format!("could not parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::config(format!("no private key in {}", path.display())))
}

/// The SNI name to verify an upstream against, derived from the dial
/// address. IP literals become `ServerName::IpAddress`.
pub fn server_name_for(addr: &str) -> Result<ServerName<'static>, Error> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::config(format!("bad server name {host:?}: {e}")))
}

fn leaf_dns_names(end_entity: &CertificateDer<'_>) -> Result<Vec<String>, rustls::Error> {
    let (_, cert) = X509Certificate::from_der(end_entity)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
    let names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(names)
}

/// Runs webpki chain verification first, then accepts the peer only when
/// the leaf presents an allowed SAN DNS name.
#[derive(Debug)]
struct AllowedDnsNamesVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    allowed: Vec<String>,
}

impl ClientCertVerifier for AllowedDnsNamesVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;
        let names = leaf_dns_names(end_entity)?;
        if names
            .iter()
            .any(|name| self.allowed.iter().any(|allowed| allowed == name))
        {
            Ok(verified)
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}
