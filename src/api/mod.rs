//! HTTP adapter over `SessionRegistry`, on a plain `TcpListener`.
//!
//! Routes:
//! - `GET  /health`
//! - `POST /sessions` `{source_uri}` (or legacy `{rtsp_url}`)
//! - `GET  /sessions`
//! - `GET  /sessions/{id}`
//! - `POST /sessions/{id}/stop`
//! - `GET  /sessions/{id}/results?limit=N`
//! - `GET  /sessions/{id}/images`
//! - `GET  /sessions/{id}/images/{name}`
//! - `GET  /sessions/{id}/stats`
//! - `GET  /sessions/{id}/stream` (MJPEG, one generator per viewer)
//!
//! Every connection gets its own thread and is closed after one response.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{LivewatchConfig, StreamSettings};
use crate::error::SessionError;
use crate::session::SessionRegistry;
use crate::storage::{self, DEFAULT_RESULTS_LIMIT};
use crate::stream::{self, StreamBroadcaster};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamSettings,
}

impl ApiConfig {
    pub fn from_config(config: &LivewatchConfig) -> Self {
        Self {
            addr: config.api_addr.clone(),
            stream: config.stream.clone(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_config(&LivewatchConfig::default())
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and end open streams.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<SessionRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("session api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(ConnectionContext {
            registry: self.registry,
            stream: self.cfg.stream,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("session api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    stream: StreamSettings,
    shutdown: Arc<AtomicBool>,
}

fn run_api(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("session api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("session api could not spawn connection thread: {}", err);
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

#[derive(Deserialize)]
struct CreateSessionBody {
    source_uri: Option<String>,
    rtsp_url: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let registry = &ctx.registry;

    match (request.method.as_str(), segments.as_slice()) {
        ("OPTIONS", _) => write_response(&mut stream, 204, "text/plain", b""),
        ("GET", ["health"]) => write_json(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", ["sessions"]) => {
            write_json(&mut stream, 200, &json!({"sessions": registry.list()}))
        }
        ("POST", ["sessions"]) => {
            let body: CreateSessionBody = match serde_json::from_slice(&request.body) {
                Ok(body) => body,
                Err(_) => return write_error(&mut stream, 400, "request body must be JSON"),
            };
            let Some(uri) = body.source_uri.or(body.rtsp_url) else {
                return write_error(&mut stream, 400, "source_uri is required");
            };
            match registry.create(&uri) {
                Ok(view) => write_json(
                    &mut stream,
                    201,
                    &json!({"session_id": view.session_id, "status": view.status}),
                ),
                Err(err) => write_session_error(&mut stream, &err),
            }
        }
        ("GET", ["sessions", id]) => match registry.status(id) {
            Ok(view) => write_json(&mut stream, 200, &view),
            Err(err) => write_session_error(&mut stream, &err),
        },
        ("POST", ["sessions", id, "stop"]) => match registry.stop(id) {
            Ok(view) => write_json(
                &mut stream,
                200,
                &json!({"session_id": view.session_id, "status": view.status}),
            ),
            Err(err) => write_session_error(&mut stream, &err),
        },
        ("GET", ["sessions", id, "results"]) => {
            let limit = match request.query.get("limit") {
                None => DEFAULT_RESULTS_LIMIT,
                Some(raw) => match raw.parse::<usize>() {
                    Ok(limit) => limit,
                    Err(_) => {
                        return write_error(&mut stream, 400, "limit must be a non-negative integer")
                    }
                },
            };
            let paths = match registry.paths(id) {
                Ok(paths) => paths,
                Err(err) => return write_session_error(&mut stream, &err),
            };
            match storage::latest_results(&paths.results_dir, &paths.images_dir, limit) {
                Ok(results) => {
                    write_json(&mut stream, 200, &json!({"session_id": id, "results": results}))
                }
                Err(err) => write_internal(&mut stream, &err),
            }
        }
        ("GET", ["sessions", id, "images"]) => {
            let paths = match registry.paths(id) {
                Ok(paths) => paths,
                Err(err) => return write_session_error(&mut stream, &err),
            };
            match storage::list_images(&paths.images_dir) {
                Ok(images) => {
                    write_json(&mut stream, 200, &json!({"session_id": id, "images": images}))
                }
                Err(err) => write_internal(&mut stream, &err),
            }
        }
        ("GET", ["sessions", id, "images", name]) => {
            let bytes = registry
                .paths(id)
                .and_then(|paths| storage::read_image(&paths.images_dir, name));
            match bytes {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) => write_session_error(&mut stream, &err),
            }
        }
        ("GET", ["sessions", id, "stats"]) => {
            let paths = match registry.paths(id) {
                Ok(paths) => paths,
                Err(err) => return write_session_error(&mut stream, &err),
            };
            match storage::session_statistics(&paths.results_dir) {
                Ok(stats) => write_json(&mut stream, 200, &stats),
                Err(err) => write_internal(&mut stream, &err),
            }
        }
        ("GET", ["sessions", id, "stream"]) => serve_stream(stream, ctx, id),
        (_, ["health"])
        | (_, ["sessions"])
        | (_, ["sessions", _])
        | (_, ["sessions", _, "stop" | "results" | "images" | "stats" | "stream"])
        | (_, ["sessions", _, "images", _]) => write_error(&mut stream, 405, "method not allowed"),
        _ => write_error(&mut stream, 404, "not found"),
    }
}

/// Multipart stream until the viewer disconnects or the server stops.
/// Unknown or stopped sessions still get a stream of error frames.
fn serve_stream(mut stream: TcpStream, ctx: &ConnectionContext, session_id: &str) -> Result<()> {
    let _ = stream.set_nodelay(true);
    stream.set_write_timeout(Some(Duration::from_secs(2)))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Expires: 0\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        stream::CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let broadcaster =
        StreamBroadcaster::new(session_id, Arc::clone(&ctx.registry), ctx.stream.clone());
    broadcaster.run(&mut stream, &ctx.shutdown);
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end.min(data.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    log::warn!("session api responded {}: {}", status, message);
    write_json(stream, status, &ErrorBody { error: message })
}

fn write_internal(stream: &mut TcpStream, err: &anyhow::Error) -> Result<()> {
    log::error!("session api storage read failed: {:#}", err);
    write_json(stream, 500, &ErrorBody { error: "failed to read session artifacts" })
}

fn write_session_error(stream: &mut TcpStream, err: &SessionError) -> Result<()> {
    write_error(stream, err.status_code(), &err.to_string())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
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
    query: HashMap<String, String>,
    body: Vec<u8>,
}
