//! Downstream HTTP surface: the relayed stream plus the detection control endpoints.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{DetectionPipeline, DetectionSnapshot};
use crate::error::RelayError;
use crate::frame::MULTIPART_CONTENT_TYPE;
use crate::relay::{RelayContext, RelaySession};

const MAX_REQUEST_BYTES: usize = 8192;
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const INDEX_PAGE: &str = r#"<html>
  <head><title>MJPEG Relay</title></head>
  <body>
    <h1>Live Stream</h1>
    <img src="/stream" width="640" height="480" />
  </body>
</html>
"#;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8081".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting and signal every running session to close.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    relay: Arc<RelayContext>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, relay: Arc<RelayContext>) -> Self {
        Self { cfg, relay }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("relay listening on http://{}", addr);

        let shutdown = self.relay.shutdown.clone();
        let relay = self.relay;
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, relay) {
                    log::error!("http server stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, relay: Arc<RelayContext>) -> Result<()> {
    let session_ids = Arc::new(AtomicU64::new(1));
    loop {
        if relay.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let relay = relay.clone();
                let session_ids = session_ids.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &relay, &session_ids) {
                            log::warn!("request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    relay: &Arc<RelayContext>,
    session_ids: &AtomicU64,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!("{} {}", request.method, request.raw_path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_response(&mut stream, 200, "text/html", INDEX_PAGE.as_bytes()),
        ("GET", "/ping") => write_response(&mut stream, 200, "text/plain", b"OK"),
        ("GET", "/stream") => {
            let id = session_ids.fetch_add(1, Ordering::SeqCst);
            serve_stream(stream, relay.clone(), id)
        }
        (method, path) if path == "/detection" || path.starts_with("/detection/") => {
            let Some(pipeline) = relay.pipeline.as_deref() else {
                return write_json_response(&mut stream, 503, r#"{"error":"detection_unavailable"}"#);
            };
            handle_detection(&mut stream, pipeline, method, path, &request)
        }
        (_, "/" | "/ping" | "/stream") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_stream(mut stream: TcpStream, relay: Arc<RelayContext>, id: u64) -> Result<()> {
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {MULTIPART_CONTENT_TYPE}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Expires: 0\r\n\
         Connection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    log::info!(
        "session {}: client {} connected",
        id,
        stream.peer_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    RelaySession::new(id, relay, stream).run();
    Ok(())
}

#[derive(Serialize)]
struct RateResponse<'a> {
    model: &'a str,
    fps: f32,
}

#[derive(Serialize)]
struct ResultsResponse<'a> {
    enabled: bool,
    active_model: Option<String>,
    results: Option<&'a DetectionSnapshot>,
}

fn handle_detection(
    stream: &mut TcpStream,
    pipeline: &DetectionPipeline,
    method: &str,
    path: &str,
    request: &HttpRequest,
) -> Result<()> {
    match (method, path) {
        ("GET", "/detection") => write_json(stream, 200, &pipeline.status()),
        ("POST", "/detection/enable") => match pipeline.enable() {
            Ok(()) => write_json(stream, 200, &pipeline.status()),
            Err(err) => write_relay_error(stream, &err),
        },
        ("POST", "/detection/disable") => {
            pipeline.disable();
            write_json(stream, 200, &pipeline.status())
        }
        ("POST", "/detection/model") => {
            let Some(name) = request.query("name") else {
                return write_json_response(stream, 400, r#"{"error":"missing_name"}"#);
            };
            match pipeline.switch_model(name) {
                Ok(()) => write_json(stream, 200, &pipeline.status()),
                Err(err) => write_relay_error(stream, &err),
            }
        }
        ("GET" | "POST", "/detection/rate") => {
            let model = match request.query("model") {
                Some(model) => model.to_string(),
                None => match pipeline.active_model() {
                    Some(model) => model,
                    None => return write_relay_error(stream, &RelayError::NoActiveModel),
                },
            };
            let outcome = if method == "POST" {
                let Some(fps) = request.query("fps").and_then(|v| v.parse::<f32>().ok()) else {
                    return write_json_response(stream, 400, r#"{"error":"invalid_fps"}"#);
                };
                pipeline.set_rate(&model, fps)
            } else {
                pipeline.rate(&model)
            };
            match outcome {
                Ok(fps) => write_json(stream, 200, &RateResponse { model: &model, fps }),
                Err(err) => write_relay_error(stream, &err),
            }
        }
        ("GET", "/detection/results") => {
            let latest = pipeline.latest();
            let response = ResultsResponse {
                enabled: pipeline.is_enabled(),
                active_model: pipeline.active_model(),
                results: latest.as_deref(),
            };
            write_json(stream, 200, &response)
        }
        (
            _,
            "/detection" | "/detection/enable" | "/detection/disable" | "/detection/model"
            | "/detection/rate" | "/detection/results",
        ) => write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#),
        _ => write_json_response(stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        params,
        raw_path: raw_path.to_string(),
    })
}

fn write_relay_error(stream: &mut TcpStream, err: &RelayError) -> Result<()> {
    let status = match err {
        RelayError::UnknownModel(_) => 404,
        RelayError::ModelUnavailable(_) | RelayError::NoActiveModel => 409,
        _ => 500,
    };
    let body = serde_json::json!({ "error": err.to_string() });
    write_response(stream, status, "application/json", body.to_string().as_bytes())
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nAccess-Control-Allow-Origin: *\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
