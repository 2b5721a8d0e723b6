use std::io::Write;
use std::os::fd::IntoRawFd;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use nspipe::addr::Endpoint;
use nspipe::config::{ClientConfig, ListenConfig, Strategy};
use nspipe::fdpass::recv_fd;
use nspipe::listener::stream_from_fd;
use nspipe::proxy;
use nspipe::tls::TlsSettings;

const PAYLOAD: &[u8] = b"hello there";

/// Trusts any server certificate; the test only cares that termination and
/// descriptor passing preserve the plaintext.
#[derive(Debug)]
struct TrustAnything(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for TrustAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A TLS connection accepted and terminated by the unix-send role must
/// deliver the identical plaintext bytes over the passed descriptor.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminated_tls_plaintext_crosses_the_fd_channel() {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["proxy.local".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();

    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(key.serialize_pem().as_bytes()).unwrap();

    let (harness_end, strategy_end) = std::os::unix::net::UnixStream::pair().unwrap();
    harness_end.set_nonblocking(true).unwrap();
    let harness_end = tokio::net::UnixStream::from_std(harness_end).unwrap();
    let channel_fd = strategy_end.into_raw_fd();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let listen_fd = listener.into_raw_fd();
    std::env::set_var("LISTEN_PID", std::process::id().to_string());
    std::env::set_var("LISTEN_FDS", (listen_fd - 2).to_string());
    std::env::remove_var("FIX_LISTEN_PID");

    let listen = ListenConfig {
        addr: Endpoint::new(format!("FD:{listen_fd}")),
        tls: TlsSettings {
            cert_file: Some(cert_file.path().to_path_buf()),
            key_file: Some(key_file.path().to_path_buf()),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = ClientConfig {
        addr: Endpoint::new(format!("FD:{channel_fd}")),
        ..Default::default()
    };
    assert_eq!(Strategy::select(&listen, &client), Strategy::UnixSend);

    let cancel = CancellationToken::new();
    let proxy_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { proxy::run(&listen, &client, cancel).await })
    };

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnything(
            rustls::crypto::ring::default_provider(),
        )))
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let tcp = tokio::net::TcpStream::connect(listen_addr).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("proxy.local").unwrap(), tcp)
        .await
        .unwrap();
    tls.write_all(PAYLOAD).await.unwrap();

    // the harness plays the parent: what arrives is one end of a
    // socketpair carrying the decrypted byte stream
    let received = recv_fd(&harness_end).await.unwrap();
    let mut plaintext = stream_from_fd(received).unwrap().into_boxed();
    let mut buf = vec![0u8; PAYLOAD.len()];
    plaintext.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, PAYLOAD);

    // and the return path re-encrypts
    plaintext.write_all(b"roger").await.unwrap();
    let mut reply = vec![0u8; 5];
    tls.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"roger");

    cancel.cancel();
    proxy_task.await.unwrap().unwrap();
}
