//! MQTT client builder with TLS support.
//!
//! `ClientBuilder` turns an `MqttConfig` into rumqttc's `AsyncClient` and
//! `EventLoop`. It does not connect; the connection kernel drives the event
//! loop, and the first poll performs the CONNECT handshake.
//!
//! # Examples
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build()?;
//! ```

use std::{fs, sync::Arc, time::Duration};

use rumqttc::{
    tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    },
    AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport,
};
use tracing::{debug, warn};
use validator::Validate;

use super::{
    config::{MqttConfig, TlsConfig},
    error::TransferError,
};

/// Builder for the session's client and event loop.
///
/// The returned `AsyncClient` is cheap to clone and safe to share; the
/// `EventLoop` must be polled from a single task.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            tls_config: None,
        }
    }

    /// Creates a builder from a validated configuration snapshot.
    ///
    /// Credentials are only applied when a user is configured. TLS is
    /// enabled when the scheme is `ssl`, `tls` or `mqtts`.
    pub fn from_config(config: &MqttConfig) -> Result<Self, TransferError> {
        config.validate()?;

        let mut builder = Self::new(
            config.client_id.clone(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive)
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight);

        if !config.user.is_empty() {
            builder = builder.credentials(config.user.clone(), config.password.clone());
        }

        if config.uses_tls() {
            builder.tls_config = Some(config.tls.clone());
        }

        Ok(builder)
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    /// Sets MQTT authentication credentials.
    ///
    /// These travel in the CONNECT packet, in clear text unless TLS is used.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    /// Sets the maximum number of unacknowledged QoS 1/2 publishes.
    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        Ok(fs::read(path)?)
    }

    /// Builds the TLS transport from the configured policy.
    ///
    /// With verification on, the server is checked against the CA file when
    /// one is set and against the system root certificates otherwise. With
    /// verification off, the server certificate is not checked at all.
    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        if tls_config.insecure_skip_verify {
            warn!("TLS certificate verification is disabled for the MQTT broker connection");
            return Ok(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
                insecure_client_config(),
            ))));
        }

        let Some(ca_path) = tls_config.ca_cert_path.as_deref() else {
            debug!("No CA file configured, verifying the broker against system roots");
            return Ok(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
                system_roots_config()?,
            ))));
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca: Self::load_file(ca_path)?,
            client_auth: None,
            alpn: None,
        }))
    }

    /// Constructs the client and event loop. Consumes the builder.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls_config) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls_config)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}

fn system_roots_config() -> Result<rustls::ClientConfig, TransferError> {
    let certs = rustls_native_certs::load_native_certs().map_err(|e| {
        TransferError::ClientSetup(format!("unable to load system root certificates: {e}"))
    })?;

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!(ignored, "Skipped unparsable system root certificates");
    }
    if added == 0 {
        return Err(TransferError::ClientSetup(
            "no usable system root certificates found".into(),
        ));
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Certificate verifier that accepts every server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
