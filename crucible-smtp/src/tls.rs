//! STARTTLS upgrade over a blocking `TcpStream`, and the TLS assurance level actually achieved:
//! `None < Unverified < DomainMatch < TofuOnly < TofuPinned`. CA-validated connections get
//! `DomainMatch`; otherwise assurance depends on whether the peer's leaf certificate fingerprint
//! matches (or is recorded as) a pin for that host.

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock};

use crucible_base::{transient, Result};
use crucible_crypto::HashAlg;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::schema::TlsAssurance;

static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();

fn ensure_provider_installed() {
    PROVIDER_INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate chain, deferring the actual trust decision to pin comparison. Used
/// only when the caller is not asking for CA-validated `DomainMatch` assurance.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Records the fingerprint last seen for each host, for trust-on-first-use pinning. Callers that
/// want pinning to survive process restarts should persist/reload this through the store.
pub trait PinStore: Send + Sync {
    fn get(&self, host: &str) -> Option<Vec<u8>>;
    fn set(&self, host: &str, fingerprint: Vec<u8>);
}

#[derive(Default)]
pub struct InMemoryPinStore(Mutex<std::collections::HashMap<String, Vec<u8>>>);

impl PinStore for InMemoryPinStore {
    fn get(&self, host: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(host).cloned()
    }
    fn set(&self, host: &str, fingerprint: Vec<u8>) {
        self.0.lock().unwrap().insert(host.to_string(), fingerprint);
    }
}

pub struct TlsUpgrade {
    pub stream: StreamOwned<ClientConnection, TcpStream>,
    pub assurance: TlsAssurance,
}

fn build_config(validate_ca: bool) -> ClientConfig {
    ensure_provider_installed();
    if validate_ca {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
    } else {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        config.enable_sni = true;
        config
    }
}

/// Upgrades `tcp` to TLS for `domain`. `requirement` is the message's minimum acceptable
/// assurance; `DomainMatch` or above validates against the system CA roots, anything below
/// accepts any certificate and falls back to fingerprint pinning via `pins`.
pub fn starttls_upgrade(tcp: TcpStream, domain: &str, requirement: TlsAssurance, pins: &dyn PinStore) -> Result<TlsUpgrade> {
    let validate_ca = requirement >= TlsAssurance::DomainMatch;
    let config = build_config(validate_ca);
    let server_name = ServerName::try_from(domain.to_string()).map_err(|e| transient(format!("bad server name {domain}: {e}")))?;
    let conn = ClientConnection::new(Arc::new(config), server_name).map_err(|e| transient(format!("tls setup: {e}")))?;
    let mut stream = StreamOwned::new(conn, tcp);
    // Drive the handshake to completion; rustls otherwise defers it to the first read/write.
    while stream.conn.is_handshaking() {
        stream.conn.complete_io(&mut stream.sock).map_err(|e| transient(format!("tls handshake: {e}")))?;
    }
    stream.flush().map_err(|e| transient(format!("tls handshake flush: {e}")))?;

    let assurance = if validate_ca {
        TlsAssurance::DomainMatch
    } else {
        let leaf = stream
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| transient("tls: no peer certificate"))?;
        let fingerprint = HashAlg::Sha256.digest(leaf.as_ref());
        match pins.get(domain) {
            Some(pinned) if pinned == fingerprint => TlsAssurance::TofuPinned,
            Some(_) => TlsAssurance::Unverified, // pin mismatch: treat as if unpinned, never silently re-pin
            None => {
                pins.set(domain, fingerprint);
                TlsAssurance::TofuOnly
            }
        }
    };
    Ok(TlsUpgrade { stream, assurance })
}
