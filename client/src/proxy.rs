//! Local proxy for forwarding requests
//!
//! Replays one [`InboundRequestFrame`] against `localhost:{port}` and turns
//! whatever happens into exactly one [`OutboundResponseFrame`].

use porthole_shared::protocol::{HeaderMap, InboundRequestFrame, OutboundResponseFrame};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure talking to the local service. Never leaves this module as an
/// error: it becomes a 502 response frame.
#[derive(Debug, Error)]
pub enum LocalServiceError {
    #[error("invalid method `{0}`")]
    InvalidMethod(String),

    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    #[error("invalid request body: {0}")]
    Body(#[from] base64::DecodeError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Forwards requests to the service on `localhost:{port}`.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: Client,
    port: u16,
}

impl LocalForwarder {
    pub fn new(port: u16) -> Result<Self, LocalServiceError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .http1_only()
            .build()?;
        Ok(Self { client, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn local_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://localhost:{}{}", self.port, path)
        } else {
            format!("http://localhost:{}/{}", self.port, path)
        }
    }

    /// Forward one request. Local failures yield a 502 frame.
    pub async fn forward(&self, frame: InboundRequestFrame) -> OutboundResponseFrame {
        match self.try_forward(&frame).await {
            Ok(response) => {
                debug!(
                    "{} {} -> {} ({} bytes)",
                    frame.method,
                    frame.path,
                    response.status,
                    response.body.len()
                );
                response
            }
            Err(e) => {
                warn!(
                    "Local request {} {} on port {} failed: {}",
                    frame.method, frame.path, self.port, e
                );
                OutboundResponseFrame::bad_gateway(frame.request_id)
            }
        }
    }

    async fn try_forward(
        &self,
        frame: &InboundRequestFrame,
    ) -> Result<OutboundResponseFrame, LocalServiceError> {
        let method = Method::from_bytes(frame.method.as_bytes())
            .map_err(|_| LocalServiceError::InvalidMethod(frame.method.clone()))?;

        let mut request = self.client.request(method, self.local_url(&frame.path));

        for (name, values) in frame.headers.iter() {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| LocalServiceError::InvalidHeader(name.to_string()))?;
            for value in values.iter() {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| LocalServiceError::InvalidHeader(name.to_string()))?;
                request = request.header(header.clone(), value);
            }
        }

        if let Some(body) = frame.decode_body()? {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            headers.append(name.as_str(), header_text(name, value));
        }

        // Buffered in full before framing
        let body = response.bytes().await?.to_vec();

        Ok(OutboundResponseFrame {
            request_id: frame.request_id.clone(),
            status,
            headers,
            body,
        })
    }
}

/// Header value as text, one char per byte (latin-1) when it is not plain ASCII
fn header_text(name: &HeaderName, value: &HeaderValue) -> String {
    match value.to_str() {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("Header {} is not visible ASCII, decoding as latin-1", name);
            value.as_bytes().iter().map(|&b| char::from(b)).collect()
        }
    }
}
