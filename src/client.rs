//! WebSocket connection factory for measurement phases.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{Connector, MaybeTlsStream, connect_async_tls_with_config};
use tracing::debug;
use url::Url;

use crate::error::{Result, SpeedTestError};
use crate::params;

/// A certificate verifier that accepts any certificate.
/// Used with --no-verify for testing against servers with self-signed certs.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Type alias for the WebSocket stream used by download and upload phases.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The close frame sent when the client ends a phase on its own terms.
pub(crate) fn normal_close() -> tokio_tungstenite::tungstenite::protocol::CloseFrame {
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};
    CloseFrame {
        code: CloseCode::Normal,
        reason: "measurement complete".into(),
    }
}

/// Opens ndt7 WebSocket connections with the handshake metadata the
/// measurement servers expect.
pub struct Client {
    client_name: String,
    client_version: String,
    no_verify_tls: bool,
}

impl Client {
    /// Create a new factory. `client_name` and `client_version` identify the
    /// calling application in requests to M-Lab servers.
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Client {
            client_name: client_name.into(),
            client_version: client_version.into(),
            no_verify_tls: false,
        }
    }

    /// Skip TLS certificate verification.
    pub fn danger_no_verify_tls(mut self) -> Self {
        self.no_verify_tls = true;
        self
    }

    /// Establish a WebSocket connection to the given service URL.
    ///
    /// `service_url` is the full URL from the Locate API, e.g.
    /// "wss://mlab1-lga06:4443/ndt/v7/download?access_token=...". When set,
    /// `device_name` is attached to the opening handshake.
    pub async fn connect(&self, service_url: &str, device_name: Option<&str>) -> Result<WsStream> {
        // Parse the URL and append client metadata as query parameters.
        let mut url = Url::parse(service_url)?;
        url.query_pairs_mut()
            .append_pair("client_name", &self.client_name)
            .append_pair("client_version", &self.client_version)
            .append_pair("client_os", std::env::consts::OS)
            .append_pair("client_arch", std::env::consts::ARCH);

        // Build the HTTP request with required headers.
        let mut request = url.to_string().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            params::SEC_WEBSOCKET_PROTOCOL.parse().unwrap(),
        );
        request
            .headers_mut()
            .insert("User-Agent", self.user_agent().parse().unwrap());
        if let Some(name) = device_name {
            let value = name.parse().map_err(|_| {
                SpeedTestError::TestFailed(format!("device name is not a valid header value: {name}"))
            })?;
            request.headers_mut().insert(params::DEVICE_NAME_HEADER, value);
        }

        let config = WebSocketConfig::default()
            .max_message_size(Some(params::MAX_FRAME_SIZE))
            .max_frame_size(Some(params::MAX_FRAME_SIZE))
            // one in-flight upload payload plus framing; never unbounded
            .max_write_buffer_size(params::MAX_MESSAGE_SIZE + (1 << 17));

        // Connect using rustls for TLS.
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls_config = if self.no_verify_tls {
            rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let root_store =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        debug!(url = %url, "opening websocket");
        let connector = Connector::Rustls(Arc::new(tls_config));
        let (ws_stream, _response) = timeout(
            params::HANDSHAKE_TIMEOUT,
            connect_async_tls_with_config(request, Some(config), false, Some(connector)),
        )
        .await
        .map_err(|_| SpeedTestError::Timeout)??;

        Ok(ws_stream)
    }

    /// User-Agent string sent on locator requests and WebSocket handshakes.
    pub(crate) fn user_agent(&self) -> String {
        format!(
            "{}/{} {}/{}",
            &self.client_name,
            &self.client_version,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }
}
