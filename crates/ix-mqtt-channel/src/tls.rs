//! TLS trust bundle for broker connections.
//!
//! Resolves a PEM-encoded CA bundle from a local file or an
//! `http(s)://` URL and configures rumqttc's TLS transport with it.

use rumqttc::{TlsConfiguration, Transport};

use crate::error::{MqttError, MqttResult};

/// A validated PEM bundle holding at least one certificate.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    pem: Vec<u8>,
    certificates: usize,
}

impl TrustBundle {
    /// Load a bundle from a file path or `http://` / `https://` URL.
    pub async fn load(source: &str) -> MqttResult<Self> {
        let data = if is_url(source) {
            fetch(source).await?
        } else {
            tokio::fs::read(source)
                .await
                .map_err(|e| MqttError::Tls(format!("failed to read CA bundle '{source}': {e}")))?
        };

        let bundle = Self::from_pem(data)?;
        tracing::info!(
            source,
            certificates = bundle.certificates,
            "trust bundle loaded"
        );
        Ok(bundle)
    }

    /// Validate raw PEM bytes. An empty or malformed bundle is an error,
    /// never an empty trust store.
    pub fn from_pem(pem: Vec<u8>) -> MqttResult<Self> {
        let certificates = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MqttError::Pem(e.to_string()))?
            .len();

        if certificates == 0 {
            return Err(MqttError::Pem("no certificates found".into()));
        }

        Ok(Self { pem, certificates })
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates
    }

    /// Server-authenticated TLS transport trusting this bundle.
    pub fn transport(&self) -> Transport {
        Transport::tls_with_config(TlsConfiguration::Simple {
            ca: self.pem.clone(),
            alpn: None,
            client_auth: None,
        })
    }
}

/// Plain TCP transport (local development brokers only).
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

async fn fetch(url: &str) -> MqttResult<Vec<u8>> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| MqttError::Tls(format!("failed to fetch CA bundle '{url}': {e}")))?;

    let body = response
        .bytes()
        .await
        .map_err(|e| MqttError::Tls(format!("failed to read CA bundle body '{url}': {e}")))?;

    Ok(body.to_vec())
}
