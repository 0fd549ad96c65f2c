//! HTTP façade over zone administration and the count read side.
//!
//! Minimal HTTP/1.1 on a std `TcpListener`, one request per connection,
//! served from a background thread that owns its own store handle.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::stats::{self, CountQuery};
use crate::storage::{RecordStore, ZoneStore};
use crate::zones::ZoneRegistry;
use crate::{polygon_from_pairs, ErrorKind, OccupancyError, OccupancyResult, Zone, ZoneKey};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer<S> {
    addr: String,
    store: S,
}

impl<S> ApiServer<S>
where
    S: ZoneStore + RecordStore + 'static,
{
    pub fn new(addr: &str, store: S) -> Self {
        Self {
            addr: addr.to_string(),
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let mut registry = ZoneRegistry::new(self.store);
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &mut registry, shutdown_thread) {
                log::error!("occupancy api stopped: {}", err);
            }
        });
        log::info!("occupancy api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api<S: ZoneStore + RecordStore>(
    listener: TcpListener,
    registry: &mut ZoneRegistry<S>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, registry) {
                    log::warn!("occupancy api request failed: {}", err);
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

fn handle_connection<S: ZoneStore + RecordStore>(
    mut stream: TcpStream,
    registry: &mut ZoneRegistry<S>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let body = error_body(&OccupancyError::invalid_input(err.to_string()));
            write_json_response(&mut stream, 400, &body)?;
            return Err(err);
        }
    };
    let (status, body) = route(&request, registry);
    write_json_response(&mut stream, status, &body)
}

fn route<S: ZoneStore + RecordStore>(
    request: &HttpRequest,
    registry: &mut ZoneRegistry<S>,
) -> (u16, Value) {
    let expected = match request.path.as_str() {
        "/health" | "/api/stats" | "/api/stats/live" | "/api/area" => "GET",
        "/api/get/area" | "/api/set/area" | "/api/update/area" | "/api/delete/area" => "POST",
        _ => {
            return (
                404,
                error_body(&OccupancyError::not_found(format!(
                    "no route for {}",
                    request.path
                ))),
            )
        }
    };
    if request.method != expected {
        return (
            405,
            json!({"status": "error", "code": "METHOD_NOT_ALLOWED", "message": format!("use {}", expected)}),
        );
    }

    let result = match request.path.as_str() {
        "/health" => return (200, json!({"status": "ok"})),
        "/api/stats" => parse_count_query(&request.query).and_then(|query| {
            let page = stats::query_counts(registry.store_mut(), &query)?;
            Ok(success("stats retrieved", json!(page)))
        }),
        "/api/stats/live" => stats::latest_count(registry.store_mut())
            .map(|latest| success("latest count retrieved", json!(latest))),
        "/api/area" => registry
            .list(request.query.get("location").map(String::as_str))
            .map(|zones| success("areas retrieved", json!(zones))),
        "/api/get/area" => parse_area(&request.body)
            .and_then(|req| registry.get(&req.key()))
            .map(|zone| success("area retrieved", json!(zone))),
        "/api/set/area" => parse_area(&request.body)
            .and_then(|req| {
                let polygon = req.polygon()?;
                registry.set(Zone::new(&req.location, &req.area_name, polygon)?)
            })
            .map(|zone| success("area created", json!(zone))),
        "/api/update/area" => parse_area(&request.body)
            .and_then(|req| registry.update(&req.key(), req.polygon()?))
            .map(|zone| success("area updated", json!(zone))),
        // "/api/delete/area"
        _ => parse_area(&request.body)
            .and_then(|req| registry.delete(&req.key()))
            .map(|()| success("area deleted", Value::Null)),
    };
    match result {
        Ok(body) => (200, body),
        Err(err) => {
            if err.kind() == ErrorKind::ServerError || err.kind() == ErrorKind::UpstreamUnavailable {
                log::error!("{} {} failed: {}", request.method, request.path, err);
            }
            (status_for(err.kind()), error_body(&err))
        }
    }
}

pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::AlreadyExists => 409,
        ErrorKind::InvalidInput => 400,
        ErrorKind::UpstreamUnavailable => 503,
        ErrorKind::ServerError => 500,
    }
}

fn success(message: &str, data: Value) -> Value {
    json!({"status": "success", "message": message, "data": data})
}

fn error_body(err: &OccupancyError) -> Value {
    json!({"status": "error", "code": err.code(), "message": err.message()})
}

#[derive(Debug, Deserialize)]
struct AreaRequest {
    location: String,
    area_name: String,
    #[serde(default)]
    polygon_zone: Option<Vec<[i32; 2]>>,
}

impl AreaRequest {
    fn key(&self) -> ZoneKey {
        ZoneKey::new(&self.location, &self.area_name)
    }

    fn polygon(&self) -> OccupancyResult<Vec<crate::Point>> {
        self.polygon_zone
            .as_deref()
            .map(polygon_from_pairs)
            .ok_or_else(|| OccupancyError::invalid_input("polygon_zone is required"))
    }
}

fn parse_area(body: &[u8]) -> OccupancyResult<AreaRequest> {
    serde_json::from_slice(body)
        .map_err(|e| OccupancyError::invalid_input(format!("malformed request body: {}", e)))
}

fn parse_count_query(query: &HashMap<String, String>) -> OccupancyResult<CountQuery> {
    fn field<T: std::str::FromStr>(
        query: &HashMap<String, String>,
        name: &str,
    ) -> OccupancyResult<Option<T>> {
        query
            .get(name)
            .map(|raw| {
                raw.parse().map_err(|_| {
                    OccupancyError::invalid_input(format!("{} must be an integer", name))
                })
            })
            .transpose()
    }
    let defaults = CountQuery::default();
    Ok(CountQuery {
        start_epoch_s: field(query, "start_time")?,
        end_epoch_s: field(query, "end_time")?,
        page: field(query, "page")?.unwrap_or(defaults.page),
        limit: field(query, "limit")?.unwrap_or(defaults.limit),
    })
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + 4 + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request body"));
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
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
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
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
