//! Upstream camera sources.
//!
//! An `Upstream` opens one byte stream per call. Relay sessions never share a
//! connection: each session opens its own and drops it when it leaves streaming.

use std::io::Read;
use std::time::Duration;

use url::Url;

use crate::error::RelayError;

/// Byte stream handed to the frame extractor.
pub type UpstreamReader = Box<dyn Read + Send>;

/// Something that can (re)open the camera byte stream.
pub trait Upstream: Send + Sync {
    /// Open a fresh connection.
    fn open(&self) -> Result<UpstreamReader, RelayError>;

    /// Human-readable source description for logs.
    fn describe(&self) -> String;
}

/// Configuration for an HTTP(S) camera stream.
#[derive(Clone, Debug)]
pub struct HttpUpstreamConfig {
    /// Stream URL, e.g. `http://192.168.4.1/stream`.
    pub url: String,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Per-read socket timeout. Matches the stall timeout so a silent socket
    /// surfaces as a stall instead of blocking the session.
    pub read_timeout: Duration,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.4.1/stream".to_string(),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(2500),
        }
    }
}

/// MJPEG (or single JPEG) over HTTP(S).
pub struct HttpUpstream {
    config: HttpUpstreamConfig,
    agent: ureq::Agent,
}

impl HttpUpstream {
    pub fn new(config: HttpUpstreamConfig) -> Result<Self, RelayError> {
        let url = Url::parse(&config.url)
            .map_err(|e| RelayError::UpstreamProtocol(format!("parse upstream url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::UpstreamProtocol(format!(
                "unsupported upstream scheme '{}'; expected http(s)",
                url.scheme()
            )));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout_read(config.read_timeout)
            .build();
        Ok(Self { config, agent })
    }
}

impl Upstream for HttpUpstream {
    fn open(&self) -> Result<UpstreamReader, RelayError> {
        let response = match self.agent.get(&self.config.url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(RelayError::UpstreamProtocol(format!(
                    "upstream answered HTTP {}",
                    code
                )))
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RelayError::UpstreamUnavailable(transport.to_string()))
            }
        };
        let content_type = response.header("Content-Type").map(str::to_string);
        if let Some(content_type) = content_type.as_deref() {
            if !is_plausible_content_type(content_type) {
                return Err(RelayError::UpstreamProtocol(format!(
                    "unexpected content type '{}'",
                    content_type
                )));
            }
        }
        Ok(response.into_reader())
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

/// Fast-fail check on the declared content type. Framing itself never depends on it.
pub fn is_plausible_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence.is_empty()
        || essence.starts_with("multipart/")
        || essence.starts_with("image/")
        || essence == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_fast_fail() {
        assert!(is_plausible_content_type(
            "multipart/x-mixed-replace;boundary=123456789000000000000987654321"
        ));
        assert!(is_plausible_content_type("image/jpeg"));
        assert!(is_plausible_content_type("Multipart/X-Mixed-Replace; boundary=frame"));
        assert!(is_plausible_content_type("application/octet-stream"));
        assert!(!is_plausible_content_type("text/html; charset=utf-8"));
        assert!(!is_plausible_content_type("application/json"));
    }

    #[test]
    fn rejects_non_http_urls() {
        let config = HttpUpstreamConfig {
            url: "rtsp://camera/stream".to_string(),
            ..HttpUpstreamConfig::default()
        };
        assert!(matches!(
            HttpUpstream::new(config),
            Err(RelayError::UpstreamProtocol(_))
        ));
    }

    #[test]
    fn refused_connection_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = HttpUpstream::new(HttpUpstreamConfig {
            url: format!("http://{}/stream", addr),
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
        })
        .unwrap();
        assert!(matches!(
            upstream.open(),
            Err(RelayError::UpstreamUnavailable(_))
        ));
    }
}
