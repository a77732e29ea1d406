//! Plain TCP or TLS transport for the DevLink3 socket (spec §4.4: TLS on
//! port 50796, verify-mode per environment; plain on port 50797).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};

use crate::error::{BridgeError, Result};

pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_millis(500);

pub fn dial(host: &str, port: u16, use_tls: bool, tls_verify: bool) -> Result<Box<dyn Transport>> {
    let addr = format!("{host}:{port}");
    let socket_addrs: Vec<_> = std::net::ToSocketAddrs::to_socket_addrs(&addr)
        .map_err(|e| BridgeError::Io(e))?
        .collect();
    let addr = socket_addrs
        .into_iter()
        .next()
        .ok_or_else(|| BridgeError::Protocol(format!("could not resolve {host}")))?;

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_nodelay(true)?;

    if !use_tls {
        return Ok(Box::new(stream));
    }

    let config = build_tls_config(tls_verify)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| BridgeError::Protocol(format!("invalid server name: {host}")))?;
    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| BridgeError::Protocol(format!("tls setup failed: {e}")))?;

    Ok(Box::new(StreamOwned::new(conn, stream)))
}

fn build_tls_config(tls_verify: bool) -> Result<ClientConfig> {
    if tls_verify {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    } else {
        tracing::warn!("DevLink3 TLS certificate verification disabled");
        Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth())
    }
}

/// Accepts any server certificate. Only reachable when the operator has
/// explicitly set `DEVLINK3_TLS_VERIFY=false` (spec §4.4: "configurable
/// otherwise").
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
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
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
