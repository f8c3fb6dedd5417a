use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::{DriverError, TlsMode};

/// Builds the TLS connector for a driver. Returns `None` when the mode is
/// [`TlsMode::Disabled`]. The crypto provider is owned by the connector, no
/// process-wide default is installed.
pub(crate) fn connector(
    mode: &TlsMode,
    hostname_verification: bool,
) -> Result<Option<TlsConnector>, DriverError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let roots = match mode {
        TlsMode::Disabled => return Ok(None),
        TlsMode::TrustAll => None,
        TlsMode::Required => Some(webpki_roots()),
        TlsMode::CustomCa(path) => Some(custom_roots(path)?),
    };

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| DriverError::Tls(e.to_string()))?;

    let config = match roots {
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth(),
        Some(roots) if hostname_verification => {
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        Some(roots) => {
            let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| DriverError::Tls(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostname { verifier }))
                .with_no_client_auth()
        }
    };

    Ok(Some(TlsConnector::from(Arc::new(config))))
}

pub(crate) async fn wrap(
    connector: &TlsConnector,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>, DriverError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| DriverError::InvalidConfiguration(format!("invalid TLS server name '{host}': {e}")))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(handshake_error)
}

/// A server certificate we refuse to trust keeps being refused until the CA
/// or the TLS mode changes, so it is reported as configuration.
fn handshake_error(err: std::io::Error) -> DriverError {
    let rejected = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls| {
            matches!(
                tls,
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
            )
        });
    if rejected {
        DriverError::InvalidConfiguration(format!("server certificate rejected: {err}"))
    } else {
        DriverError::Tls(err.to_string())
    }
}

fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn custom_roots(path: &Path) -> Result<RootCertStore, DriverError> {
    let file = File::open(path).map_err(|e| {
        DriverError::InvalidConfiguration(format!(
            "cannot read CA file {}: {e}",
            path.display()
        ))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            DriverError::InvalidConfiguration(format!(
                "invalid CA file {}: {e}",
                path.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(DriverError::InvalidConfiguration(format!(
            "no certificates found in CA file {}",
            path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    let (_, ignored) = roots.add_parsable_certificates(certs);
    if roots.is_empty() {
        return Err(DriverError::InvalidConfiguration(format!(
            "none of the {ignored} certificates in {} is usable",
            path.display()
        )));
    }
    Ok(roots)
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Checks the chain against the configured roots but accepts any hostname.
#[derive(Debug)]
struct IgnoreHostname {
    verifier: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.verifier.supported_verify_schemes()
    }
}

// newer rustls releases report the mismatch with the expected and presented names attached
fn is_name_mismatch(err: &rustls::CertificateError) -> bool {
    format!("{err:?}").starts_with("NotValidForName")
}
