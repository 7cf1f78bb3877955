use anyhow::{Context, Result};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
    Certificate, ClientConfig, RootCertStore, ServerName,
};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use std::{fs::File, io::BufReader, sync::Arc, time::SystemTime};
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Verifies the chain with webpki, then requires the leaf certificate's
/// SHA-256 fingerprint to match one of the configured pins.
struct PinnedVerifier {
    inner: WebPkiVerifier,
    pins: Vec<Vec<u8>>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp: &[u8],
        now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, scts, ocsp, now)?;
        let fingerprint = Sha256::digest(&end_entity.0);
        let pinned = self
            .pins
            .iter()
            .any(|p| p.as_slice().ct_eq(fingerprint.as_slice()).into());
        if pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate pin mismatch".into()))
        }
    }
}

fn decode_pins(cert_pins: &[String]) -> Result<Vec<Vec<u8>>> {
    cert_pins
        .iter()
        .map(|p| hex::decode(p).with_context(|| format!("decoding pin: {p}")))
        .collect()
}

/// Build the client TLS configuration for the stream socket. `cert_pins` are hex-encoded SHA-256 fingerprints of
/// acceptable leaf certificates; an empty list disables pinning.
pub fn build_tls_config(
    ca_bundle: Option<&str>,
    cert_pins: &[String],
) -> Result<Arc<ClientConfig>> {
    let pins = decode_pins(cert_pins)?;

    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs().context("loading native certs")? {
        root_store.add(&Certificate(cert.0))?;
    }
    if let Some(path) = ca_bundle {
        let mut reader = BufReader::new(File::open(path).context("opening CA bundle")?);
        for cert in certs(&mut reader).context("reading CA bundle")? {
            root_store.add(&Certificate(cert))?;
        }
    }
    let verifier = WebPkiVerifier::new(root_store.clone(), None);
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if !pins.is_empty() {
        config.dangerous().set_certificate_verifier(Arc::new(PinnedVerifier {
            inner: verifier,
            pins,
        }));
    }
    Ok(Arc::new(config))
}

/// Open a TCP connection to `host:port` and complete the TLS handshake.
pub async fn connect(
    host: &str,
    port: u16,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let server_name =
        ServerName::try_from(host).with_context(|| format!("invalid server name: {host}"))?;
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    tcp.set_nodelay(true)?;
    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {host}"))
}
