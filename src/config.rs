use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Hook producing a name for worker thread `index`.
pub type ThreadNamer = Arc<dyn Fn(usize) -> String + Send + Sync>;

/// Configuration for the process-wide worker pool created by
/// [`init_services`](crate::service::init_services).
#[derive(Clone)]
pub struct ServiceConfig {
    /// Number of worker threads driving connection I/O.
    pub workers: usize,
    /// Optional naming hook for the worker threads.
    pub thread_namer: Option<ThreadNamer>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            thread_namer: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("workers", &self.workers)
            .field("thread_namer", &self.thread_namer.is_some())
            .finish()
    }
}

/// Introspected peer certificate handed to the verify callback, once per
/// certificate in the presented chain.
#[derive(Clone, Debug, Default)]
pub struct TlsCertificate {
    pub serial_number: String,

    pub issuer: String,
    pub issuer_properties: BTreeMap<String, String>,

    pub subject: String,
    pub subject_properties: BTreeMap<String, String>,

    pub sha256: Vec<u8>,
    pub sha512: Vec<u8>,

    pub version: u32,
    pub public_key_bit_size: usize,
}

/// Certificate verification hook. Returning `false` rejects the peer and
/// fails the handshake.
pub type VerifyCallback = Arc<dyn Fn(&TlsCertificate) -> bool + Send + Sync>;

/// Protocol selection. The pre-TLS-1.2 values exist for configuration
/// compatibility only; building a context from them is refused. `Sslv23`
/// and `Tls` negotiate the highest mutually supported version, with
/// TLS 1.2 as the floor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsMethod {
    Sslv2,
    Sslv3,
    Tlsv1,
    Tlsv1_1,
    #[default]
    Tlsv1_2,
    Sslv23,
    Tls,
}

/// Which side of the TLS handshake an endpoint performs. `Auto` follows
/// the transport role (connecting endpoints handshake as clients,
/// accepting endpoints as servers); the explicit values override it for
/// one-way authentication setups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsHandshakeRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// TLS parameters for secure connectors.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// PEM file with the trust anchors used to verify the peer.
    pub ca_file: Option<PathBuf>,
    /// PEM file with the local certificate chain.
    pub chain_file: Option<PathBuf>,
    /// PEM file with the local private key.
    pub key_file: Option<PathBuf>,
    /// Accepted for configuration compatibility; the backend negotiates
    /// its own key-exchange groups and ignores this with a warning.
    pub dh_file: Option<PathBuf>,
    /// Encrypted keys are not supported by the backend; setting this
    /// yields an `InvalidConfig` error rather than a silent misread.
    pub key_password: Option<String>,
    /// Invoked once per certificate in the peer chain.
    pub verify_callback: Option<VerifyCallback>,
    pub method: TlsMethod,
    /// Servers only: require and verify a client certificate.
    pub require_peer_cert: bool,
    pub handshake_role: TlsHandshakeRole,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_file", &self.ca_file)
            .field("chain_file", &self.chain_file)
            .field("key_file", &self.key_file)
            .field("dh_file", &self.dh_file)
            .field("key_password", &self.key_password.is_some())
            .field("verify_callback", &self.verify_callback.is_some())
            .field("method", &self.method)
            .field("require_peer_cert", &self.require_peer_cert)
            .field("handshake_role", &self.handshake_role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_defaults_to_hardware_concurrency() {
        let config = ServiceConfig::default();
        assert_eq!(config.workers, num_cpus::get());
        assert!(config.thread_namer.is_none());
    }

    #[test]
    fn tls_defaults() {
        let config = TlsConfig::default();
        assert_eq!(config.method, TlsMethod::Tlsv1_2);
        assert_eq!(config.handshake_role, TlsHandshakeRole::Auto);
        assert!(!config.require_peer_cert);
    }
}
