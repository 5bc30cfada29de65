use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

use livewatch::api::{ApiConfig, ApiHandle, ApiServer};
use livewatch::config::LivewatchConfig;
use livewatch::detect::{BackendRegistry, DetectorBackend, RawDetection, StubBackend};
use livewatch::ingest::RtspSourceFactory;
use livewatch::SessionRegistry;

const URI: &str = "rtsp://camera.local:554/stream1";

struct TestApi {
    _dir: TempDir,
    registry: Arc<SessionRegistry>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let mut cfg = LivewatchConfig::default();
        cfg.api_addr = "127.0.0.1:0".to_string();
        cfg.storage.results_dir = dir.path().join("results");
        cfg.storage.images_dir = dir.path().join("images");
        cfg.session.loop_pacing = Duration::from_millis(5);
        cfg.session.save_interval = Duration::ZERO;
        cfg.source.width = 160;
        cfg.source.height = 120;
        cfg.stream.cadence = Duration::from_millis(10);

        let mut backends = BackendRegistry::new();
        backends.register("stub", || {
            let person = RawDetection::new(0, 0.9, [10.0, 10.0, 50.0, 90.0]);
            Ok(Box::new(StubBackend::with_script(vec![vec![person]])) as Box<dyn DetectorBackend>)
        });
        let registry = Arc::new(SessionRegistry::new(
            cfg.clone(),
            Arc::new(RtspSourceFactory::new(cfg.source.clone())),
            Arc::new(backends),
        ));
        let api_handle = ApiServer::new(ApiConfig::from_config(&cfg), Arc::clone(&registry)).spawn()?;

        Ok(Self {
            _dir: dir,
            registry,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("no header terminator"))?;
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((headers, response[split + 4..].to_vec()))
    }

    fn json(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, Value)> {
        let (headers, body) = self.request(method, path, body)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }

    fn create_session(&self) -> Result<String> {
        let body = format!(r#"{{"source_uri": "{}"}}"#, URI);
        let (headers, json) = self.json("POST", "/sessions", Some(&body))?;
        assert!(headers.contains("201 Created"), "{headers}");
        assert_eq!(json["status"], "running");
        json["session_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing session_id"))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        self.registry.shutdown();
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition()? {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("condition not met in time"))
}

/// Body of the first multipart part, located by its Content-Length.
fn first_part(received: &[u8]) -> Option<&[u8]> {
    let find = |haystack: &[u8], needle: &[u8]| {
        haystack.windows(needle.len()).position(|w| w == needle)
    };
    let part = &received[find(received, b"--frame\r\n")?..];
    let length_at = find(part, b"Content-Length: ")? + b"Content-Length: ".len();
    let length_end = length_at + find(&part[length_at..], b"\r\n")?;
    let length: usize = std::str::from_utf8(&part[length_at..length_end])
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let body_at = length_at + find(&part[length_at..], b"\r\n\r\n")? + 4;
    part.get(body_at..body_at + length)
}

#[test]
fn health_reports_ok_with_cors_header() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, json) = api.json("GET", "/health", None)?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(json["status"], "ok");

    let (headers, _) = api.request("OPTIONS", "/sessions", None)?;
    assert!(headers.contains("204 No Content"));
    Ok(())
}

#[test]
fn create_validates_request_body() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, json) = api.json("POST", "/sessions", Some(r#"{"source_uri": "http://cam/x"}"#))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(json["error"].as_str().unwrap_or_default().contains("validation"));

    let (headers, _) = api.json("POST", "/sessions", Some("{}"))?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _) = api.json("POST", "/sessions", Some("not json"))?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, json) = api.json("POST", "/sessions", Some(r#"{"rtsp_url": "rtsp://cam/legacy"}"#))?;
    assert!(headers.contains("201 Created"));
    assert!(json["session_id"].is_string());
    Ok(())
}

#[test]
fn session_lifecycle_over_http() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;

    let (headers, view) = api.json("GET", &format!("/sessions/{id}"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(view["source_uri"], URI);
    assert_eq!(view["status"], "running");
    assert!(view["start_time"].is_f64());
    assert!(view.get("error").is_none());

    let (_, list) = api.json("GET", "/sessions", None)?;
    assert_eq!(list["sessions"].as_array().map(Vec::len), Some(1));

    let (headers, stopped) = api.json("POST", &format!("/sessions/{id}/stop"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(stopped["status"], "stopped");
    let (headers, stopped) = api.json("POST", &format!("/sessions/{id}/stop"), None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(stopped["status"], "stopped");

    let (headers, _) = api.json("POST", "/sessions/unknown/stop", None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.json("GET", "/sessions/unknown", None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.json("DELETE", &format!("/sessions/{id}"), None)?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn results_images_and_stats_are_served() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;

    wait_for(|| {
        let (_, json) = api.json("GET", &format!("/sessions/{id}/results?limit=3"), None)?;
        Ok(json["results"].as_array().map(Vec::len) == Some(3))
    })?;
    api.json("POST", &format!("/sessions/{id}/stop"), None)?;

    let (headers, json) = api.json("GET", &format!("/sessions/{id}/results?limit=2"), None)?;
    assert!(headers.contains("200 OK"));
    let results = json["results"].as_array().cloned().unwrap_or_default();
    assert_eq!(results.len(), 2);
    let keys: Vec<&str> = results.iter().filter_map(|r| r["key"].as_str()).collect();
    assert!(keys[0] > keys[1]);
    assert_eq!(results[0]["total_detections"], 1);
    assert_eq!(results[0]["detections"][0]["class"], "person");
    assert!(results[0]["annotated_image_path"].is_string());

    let (headers, _) = api.json("GET", &format!("/sessions/{id}/results?limit=abc"), None)?;
    assert!(headers.contains("400 Bad Request"));

    let (_, json) = api.json("GET", &format!("/sessions/{id}/images"), None)?;
    let images = json["images"].as_array().cloned().unwrap_or_default();
    assert!(images.len() >= 2);
    let name = images[0]["name"].as_str().unwrap_or_default().to_string();
    assert!(matches!(images[0]["type"].as_str(), Some("original" | "annotated")));

    let (headers, bytes) = api.request("GET", &format!("/sessions/{id}/images/{name}"), None)?;
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

    let (headers, _) = api.json("GET", &format!("/sessions/{id}/images/../secret.jpg"), None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.json("GET", &format!("/sessions/{id}/images/missing.jpg"), None)?;
    assert!(headers.contains("400 Bad Request") || headers.contains("404 Not Found"));

    let (_, stats) = api.json("GET", &format!("/sessions/{id}/stats"), None)?;
    assert!(stats["total_records"].as_u64().unwrap_or(0) >= 3);
    assert_eq!(stats["total_records"], stats["records_with_detections"]);
    Ok(())
}

#[test]
fn stream_emits_multipart_jpeg_parts() -> Result<()> {
    let api = TestApi::new()?;
    let id = api.create_session()?;
    wait_for(|| Ok(api.registry.status(&id)?.frame_count > 0))?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let request = format!("GET /sessions/{id}/stream HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes())?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.windows(7).filter(|w| w == b"--frame").count() < 3 {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    drop(stream);

    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("Cache-Control: no-cache"));
    assert!(text.contains("Content-Type: image/jpeg"));
    assert!(received.windows(7).filter(|w| w == b"--frame").count() >= 3);

    // Frames were flowing before the viewer connected, so parts carry live
    // video at the source size rather than a 640x480 error frame.
    let jpeg = first_part(&received).ok_or_else(|| anyhow!("no complete part"))?;
    let decoded = image::load_from_memory(jpeg)?;
    assert_eq!((decoded.width(), decoded.height()), (160, 120));

    api.json("POST", &format!("/sessions/{id}/stop"), None)?;
    Ok(())
}

#[test]
fn stream_for_unknown_session_sends_error_frames() -> Result<()> {
    let api = TestApi::new()?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /sessions/missing/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.windows(7).any(|w| w == b"--frame") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("--frame"));
    Ok(())
}
