//! TLS handshake step for the stream transports.
//!
//! Connectors model "transport-ready socket" and "connection-ready
//! session" as distinct states; this module is the step in between. A
//! [`TlsEngine`] is built once per connector from [`TlsConfig`] and then
//! performs the client or server handshake per socket. Plaintext
//! connectors use [`Security::Plain`] and skip the step entirely.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256, Sha512};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::crypto::WebPkiSupportedAlgorithms;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::prelude::*;

use crate::config::{TlsCertificate, TlsConfig, TlsHandshakeRole, TlsMethod, VerifyCallback};
use crate::error::NetError;
use crate::transport::stream::{BoxedStream, StreamIo};

/// Handshake behavior of a stream connector.
pub(crate) enum Security {
    Plain,
    Tls(TlsEngine),
}

impl Security {
    /// Turn a transport-ready socket into a connection-ready session.
    pub(crate) async fn establish<S>(&self, stream: S) -> Result<BoxedStream, NetError>
    where
        S: StreamIo + 'static,
    {
        match self {
            Security::Plain => Ok(Box::new(stream)),
            Security::Tls(engine) => engine.handshake(stream).await,
        }
    }
}

/// A ready-to-use TLS endpoint: either the connecting or the accepting
/// side of the handshake, fixed when the connector is built.
pub(crate) enum TlsEngine {
    Connect {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Accept(TlsAcceptor),
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsEngine::Connect { server_name, .. } => f
                .debug_struct("Connect")
                .field("server_name", server_name)
                .finish(),
            TlsEngine::Accept(_) => f.debug_tuple("Accept").finish(),
        }
    }
}

impl TlsEngine {
    /// Engine for a connecting endpoint. `host` becomes the verified
    /// server name unless the handshake role is overridden.
    pub(crate) fn for_client(config: &TlsConfig, host: &str) -> Result<Self, NetError> {
        validate(config)?;
        match config.handshake_role {
            TlsHandshakeRole::Auto | TlsHandshakeRole::Client => Self::connect_engine(config, host),
            TlsHandshakeRole::Server => Self::accept_engine(config),
        }
    }

    /// Engine for an accepting endpoint.
    pub(crate) fn for_server(config: &TlsConfig) -> Result<Self, NetError> {
        validate(config)?;
        match config.handshake_role {
            TlsHandshakeRole::Auto | TlsHandshakeRole::Server => Self::accept_engine(config),
            // One-way authentication setups may run the client side of
            // the handshake on an accepting socket.
            TlsHandshakeRole::Client => Self::connect_engine(config, "localhost"),
        }
    }

    pub(crate) async fn handshake<S>(&self, stream: S) -> Result<BoxedStream, NetError>
    where
        S: StreamIo + 'static,
    {
        match self {
            TlsEngine::Connect {
                connector,
                server_name,
            } => {
                let session = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(NetError::transport)?;
                debug!("client handshake completed");
                Ok(Box::new(session))
            }
            TlsEngine::Accept(acceptor) => {
                let session = acceptor.accept(stream).await.map_err(NetError::transport)?;
                debug!("server handshake completed");
                Ok(Box::new(session))
            }
        }
    }

    fn connect_engine(config: &TlsConfig, host: &str) -> Result<Self, NetError> {
        let versions = protocol_versions(config.method)?;
        let builder = ClientConfig::builder_with_protocol_versions(versions);

        let verifier: Arc<dyn ServerCertVerifier> = match &config.ca_file {
            Some(ca_file) => {
                let roots = Arc::new(load_roots(ca_file)?);
                let webpki = WebPkiServerVerifier::builder(roots).build().map_err(|e| {
                    NetError::InvalidConfig(format!("cannot build certificate verifier: {e}"))
                })?;
                match &config.verify_callback {
                    Some(callback) => Arc::new(InspectingServerVerifier {
                        inner: webpki,
                        inspect: callback.clone(),
                    }),
                    None => webpki,
                }
            }
            // No trust anchors configured: accept any presented chain,
            // still routing it through the verify callback when one is
            // installed.
            None => Arc::new(UnverifiedServerCert::new(config.verify_callback.clone())),
        };
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let client = match (&config.chain_file, &config.key_file) {
            (Some(chain_file), Some(key_file)) => builder
                .with_client_auth_cert(load_certs(chain_file)?, load_key(key_file)?)
                .map_err(|e| {
                    NetError::InvalidConfig(format!("client certificate rejected: {e}"))
                })?,
            _ => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| NetError::InvalidConfig(format!("invalid TLS server name: {host}")))?;
        Ok(Self::Connect {
            connector: TlsConnector::from(Arc::new(client)),
            server_name,
        })
    }

    fn accept_engine(config: &TlsConfig) -> Result<Self, NetError> {
        let versions = protocol_versions(config.method)?;
        let builder = ServerConfig::builder_with_protocol_versions(versions);

        let builder = if config.require_peer_cert {
            let ca_file = config.ca_file.as_ref().ok_or_else(|| {
                NetError::InvalidConfig("require_peer_cert needs a ca_file".into())
            })?;
            let roots = Arc::new(load_roots(ca_file)?);
            let webpki = WebPkiClientVerifier::builder(roots).build().map_err(|e| {
                NetError::InvalidConfig(format!("cannot build client verifier: {e}"))
            })?;
            let verifier: Arc<dyn ClientCertVerifier> = match &config.verify_callback {
                Some(callback) => Arc::new(InspectingClientVerifier {
                    inner: webpki,
                    inspect: callback.clone(),
                }),
                None => webpki,
            };
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let chain_file = config
            .chain_file
            .as_ref()
            .ok_or_else(|| NetError::InvalidConfig("TLS server needs a chain_file".into()))?;
        let key_file = config
            .key_file
            .as_ref()
            .ok_or_else(|| NetError::InvalidConfig("TLS server needs a key_file".into()))?;
        let server = builder
            .with_single_cert(load_certs(chain_file)?, load_key(key_file)?)
            .map_err(|e| NetError::InvalidConfig(format!("certificate/key rejected: {e}")))?;
        Ok(Self::Accept(TlsAcceptor::from(Arc::new(server))))
    }
}

fn validate(config: &TlsConfig) -> Result<(), NetError> {
    if config.key_password.is_some() {
        return Err(NetError::InvalidConfig(
            "encrypted private keys are not supported; provide an unencrypted PEM key".into(),
        ));
    }
    if let Some(dh_file) = &config.dh_file {
        warn!(
            path = %dh_file.display(),
            "dh parameter file ignored; key exchange groups are negotiated by the TLS backend"
        );
    }
    Ok(())
}

/// Map the legacy method enumeration to protocol versions. Anything
/// below TLS 1.2 is refused.
fn protocol_versions(
    method: TlsMethod,
) -> Result<&'static [&'static rustls::SupportedProtocolVersion], NetError> {
    match method {
        TlsMethod::Sslv2 | TlsMethod::Sslv3 | TlsMethod::Tlsv1 | TlsMethod::Tlsv1_1 => {
            Err(NetError::InvalidConfig(format!(
                "insecure TLS method {method:?} refused; the effective minimum is TLS 1.2"
            )))
        }
        TlsMethod::Tlsv1_2 => {
            static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
            Ok(TLS12_ONLY)
        }
        TlsMethod::Sslv23 | TlsMethod::Tls => Ok(rustls::ALL_VERSIONS),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetError> {
    let file = File::open(path)
        .map_err(|e| NetError::InvalidConfig(format!("cannot open {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| {
            NetError::InvalidConfig(format!("cannot parse certificates in {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(NetError::InvalidConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetError> {
    let file = File::open(path)
        .map_err(|e| NetError::InvalidConfig(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            NetError::InvalidConfig(format!("cannot parse key in {}: {e}", path.display()))
        })?
        .ok_or_else(|| {
            NetError::InvalidConfig(format!("no private key found in {}", path.display()))
        })
}

fn load_roots(path: &Path) -> Result<RootCertStore, NetError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| {
            NetError::InvalidConfig(format!("rejected trust anchor in {}: {e}", path.display()))
        })?;
    }
    Ok(roots)
}

/// Extract the certificate record handed to verify callbacks.
pub(crate) fn inspect_certificate(der: &[u8]) -> Result<TlsCertificate, String> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| e.to_string())?;
    let tbs = &cert.tbs_certificate;
    Ok(TlsCertificate {
        serial_number: tbs.raw_serial_as_string(),
        issuer: tbs.issuer.to_string(),
        issuer_properties: name_properties(&tbs.issuer),
        subject: tbs.subject.to_string(),
        subject_properties: name_properties(&tbs.subject),
        sha256: Sha256::digest(der).to_vec(),
        sha512: Sha512::digest(der).to_vec(),
        version: tbs.version.0,
        public_key_bit_size: tbs.subject_pki.subject_public_key.data.len() * 8,
    })
}

fn name_properties(name: &X509Name<'_>) -> std::collections::BTreeMap<String, String> {
    let registry = oid_registry();
    let mut properties = std::collections::BTreeMap::new();
    for rdn in name.iter_rdn() {
        for attr in rdn.iter() {
            if let Ok(value) = attr.as_str() {
                let key = oid2sn(attr.attr_type(), registry)
                    .map(str::to_owned)
                    .unwrap_or_else(|_| attr.attr_type().to_id_string());
                properties.insert(key, value.to_owned());
            }
        }
    }
    properties
}

/// Run the verify callback over the presented chain, end entity first.
fn inspect_chain(
    inspect: &VerifyCallback,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<(), rustls::Error> {
    for der in std::iter::once(end_entity).chain(intermediates.iter()) {
        let record = inspect_certificate(der.as_ref())
            .map_err(|e| rustls::Error::General(format!("certificate parse failure: {e}")))?;
        if !inspect(&record) {
            return Err(rustls::Error::General(
                "peer certificate rejected by verify callback".into(),
            ));
        }
    }
    Ok(())
}

/// WebPKI verification plus the user's per-certificate inspection.
struct InspectingServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    inspect: VerifyCallback,
}

impl fmt::Debug for InspectingServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectingServerVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for InspectingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        inspect_chain(&self.inspect, end_entity, intermediates)?;
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
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
}

/// No trust anchors configured: chain validity is not checked, matching
/// the verify-none default of the original stack. The verify callback,
/// when present, still sees every certificate and may reject the peer.
struct UnverifiedServerCert {
    inspect: Option<VerifyCallback>,
    supported: WebPkiSupportedAlgorithms,
}

impl UnverifiedServerCert {
    fn new(inspect: Option<VerifyCallback>) -> Self {
        Self {
            inspect,
            supported: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for UnverifiedServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnverifiedServerCert").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for UnverifiedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(inspect) = &self.inspect {
            inspect_chain(inspect, end_entity, intermediates)?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Client-certificate verification plus the user's inspection, used when
/// a server requires a peer certificate.
struct InspectingClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    inspect: VerifyCallback,
}

impl fmt::Debug for InspectingClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectingClientVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for InspectingClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        inspect_chain(&self.inspect, end_entity, intermediates)?;
        self.inner.verify_client_cert(end_entity, intermediates, now)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let chain = dir.join("chain.pem");
        let key = dir.join("key.pem");
        std::fs::write(&chain, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
        (chain, key)
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("msglink-tls-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn insecure_methods_are_refused() {
        for method in [
            TlsMethod::Sslv2,
            TlsMethod::Sslv3,
            TlsMethod::Tlsv1,
            TlsMethod::Tlsv1_1,
        ] {
            let config = TlsConfig {
                method,
                ..TlsConfig::default()
            };
            assert!(matches!(
                TlsEngine::for_client(&config, "localhost"),
                Err(NetError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn server_needs_certificate_material() {
        let err = TlsEngine::for_server(&TlsConfig::default()).unwrap_err();
        assert!(matches!(err, NetError::InvalidConfig(_)));
    }

    #[test]
    fn require_peer_cert_needs_a_ca() {
        let dir = temp_dir("peer-cert");
        let (chain, key) = write_self_signed(&dir);
        let config = TlsConfig {
            chain_file: Some(chain),
            key_file: Some(key),
            require_peer_cert: true,
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsEngine::for_server(&config),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn key_password_is_rejected() {
        let config = TlsConfig {
            key_password: Some("secret".into()),
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsEngine::for_client(&config, "localhost"),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn engines_build_from_pem_material() {
        let dir = temp_dir("build");
        let (chain, key) = write_self_signed(&dir);
        let server = TlsConfig {
            chain_file: Some(chain.clone()),
            key_file: Some(key),
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsEngine::for_server(&server),
            Ok(TlsEngine::Accept(_))
        ));

        let client = TlsConfig {
            ca_file: Some(chain),
            method: TlsMethod::Tls,
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsEngine::for_client(&client, "localhost"),
            Ok(TlsEngine::Connect { .. })
        ));
    }

    #[test]
    fn role_override_swaps_the_handshake_side() {
        let dir = temp_dir("role");
        let (chain, key) = write_self_signed(&dir);
        let config = TlsConfig {
            chain_file: Some(chain),
            key_file: Some(key),
            handshake_role: TlsHandshakeRole::Server,
            ..TlsConfig::default()
        };
        // A connecting endpoint told to handshake as a server builds an
        // acceptor.
        assert!(matches!(
            TlsEngine::for_client(&config, "localhost"),
            Ok(TlsEngine::Accept(_))
        ));
    }

    #[test]
    fn certificate_record_is_populated() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let record = inspect_certificate(certified.cert.der().as_ref()).unwrap();
        assert_eq!(record.sha256.len(), 32);
        assert_eq!(record.sha512.len(), 64);
        assert!(record.public_key_bit_size > 0);
        assert!(!record.serial_number.is_empty());
        assert!(!record.subject.is_empty());
    }
}
