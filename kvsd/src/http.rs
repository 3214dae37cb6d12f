//! HTTP/1.0 adapter: REST access to the store plus a static file server.
//!
//! `GET|PUT|DELETE /storage/<key>` is translated into the corresponding
//! command invocation and answered as JSON. Every other URL is served
//! from the configured web root; paths escaping the root resolve to 404.

use crate::command::{self, Command, CommandTable};
use crate::error::ServerResult;
use crate::net;
use crate::server::Server;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use tracing::{info, warn};

/// URL prefix of the REST surface.
const STORAGE_URL: &str = "/storage/";
/// File served for directory URLs.
const INDEX_FILE: &str = "index.html";
/// Upper bound on one request (headers + body).
const MAX_REQUEST_LEN: usize = 8192;

/// A parsed request.
#[derive(Debug)]
struct HttpRequest {
    method: String,
    url: String,
    body: Vec<u8>,
}

/// A response under construction.
struct HttpResponse {
    status: u16,
    content_type: Option<String>,
    extra_header: Option<String>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn new(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            extra_header: None,
            body: Vec::new(),
        }
    }

    fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            extra_header: None,
            body,
        }
    }

    fn status_name(&self) -> &'static str {
        match self.status {
            200 => "OK",
            301 => "Moved Permanently",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            _ => "",
        }
    }

    /// Serialize status line, headers and body.
    fn format_message(mut self) -> Vec<u8> {
        if self.body.is_empty() && self.status != 200 {
            self.body = format!(
                "<html>\r\n<head><title>{status} {name}</title></head>\r\n\
                 <body>\r\n<center><h1>{status} {name}</h1></center>\r\n\
                 </body>\r\n</html>\r\n",
                status = self.status,
                name = self.status_name()
            )
            .into_bytes();
            self.content_type = Some("text/html".to_string());
        }

        let mut head = format!("HTTP/1.0 {} {}\r\n", self.status, self.status_name());
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        if let Some(extra) = &self.extra_header {
            head.push_str(extra);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut message = head.into_bytes();
        message.extend_from_slice(&self.body);
        message
    }
}

#[derive(Serialize)]
struct RecordDto<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandDto<'a> {
    command: &'a str,
    key: &'a str,
    value: &'a str,
    response_message: &'a str,
    response_records_size: usize,
    response_records: Vec<RecordDto<'a>>,
}

/// Bind the HTTP port and serve one request per forked connection.
pub fn run_http_server(server: &mut Server, table: &CommandTable) -> ServerResult<()> {
    let port = server.config.http_port;
    let listener = net::bind(port)?;
    info!(port, "http server listening");
    net::accept_loop(server, table, listener, "http-cli", handle_http_client)
}

/// Read, process and answer exactly one request.
pub fn handle_http_client(server: &mut Server, table: &CommandTable, mut stream: TcpStream) {
    let response = match read_request(&mut stream) {
        Ok(Some(raw)) => match parse_request(&raw) {
            Some(request) => {
                info!(method = %request.method, url = %request.url, "http request");
                process_request(server, table, &request)
            }
            None => HttpResponse::new(400),
        },
        Ok(None) => HttpResponse::new(500), // oversized
        Err(e) => {
            warn!("http recv failed: {e}");
            return;
        }
    };

    if let Err(e) = stream.write_all(&response.format_message()) {
        warn!("http send failed: {e}");
    }
}

/// Read until the header terminator plus any `Content-Length` body.
/// `None` signals an oversized request.
fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        if raw.len() > MAX_REQUEST_LEN {
            return Ok(None);
        }
        let read = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let expected = header_end + content_length(&raw[..header_end]);
            if expected > MAX_REQUEST_LEN {
                return Ok(None);
            }
            if raw.len() >= expected {
                break;
            }
        }
    }
    Ok(Some(raw))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(headers);
    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let header_end = find_header_end(raw).unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut request_line = head.lines().next()?.split_ascii_whitespace();

    let method = request_line.next()?.to_ascii_uppercase();
    let url = request_line.next()?.to_string();
    let body = raw.get(header_end..).unwrap_or(&[]).to_vec();

    Some(HttpRequest { method, url, body })
}

fn process_request(server: &mut Server, table: &CommandTable, request: &HttpRequest) -> HttpResponse {
    if let Some(key) = request.url.strip_prefix(STORAGE_URL) {
        return process_storage_request(server, table, request, key);
    }

    if request.method != "GET" {
        let mut response = HttpResponse::new(405);
        response.extra_header = Some("Allow: GET".to_string());
        return response;
    }
    serve_webfile(&server.config.web_root, &request.url)
}

/// Translate method + URL tail into a command invocation.
fn process_storage_request(
    server: &mut Server,
    table: &CommandTable,
    request: &HttpRequest,
    key: &str,
) -> HttpResponse {
    let name = match request.method.as_str() {
        "GET" => "GET",
        "PUT" => "PUT",
        "DELETE" => "DEL",
        _ => {
            let mut response = HttpResponse::new(405);
            response.extra_header = Some("Allow: GET, PUT, DELETE".to_string());
            return response;
        }
    };

    let mut cmd = Command::new();
    cmd.name = name.to_string();
    cmd.key = key.to_string();
    cmd.value = String::from_utf8_lossy(&request.body).trim().to_string();

    command::execute(table, server, &mut cmd);

    let dto = CommandDto {
        command: &cmd.name,
        key: &cmd.key,
        value: &cmd.value,
        response_message: &cmd.response_message,
        response_records_size: cmd.response_records.len(),
        response_records: cmd
            .response_records
            .iter()
            .map(|record| RecordDto {
                key: &record.key,
                value: &record.value,
            })
            .collect(),
    };

    match serde_json::to_vec_pretty(&dto) {
        Ok(json) => HttpResponse::with_body(200, "application/json", json),
        Err(e) => {
            warn!("json encoding failed: {e}");
            HttpResponse::new(500)
        }
    }
}

/// Serve a file from the web root; traversal outside resolves to 404.
fn serve_webfile(web_root: &Path, url: &str) -> HttpResponse {
    let Ok(root) = web_root.canonicalize() else {
        return HttpResponse::new(404);
    };

    let relative = url.trim_start_matches('/');
    let Ok(mut target) = root.join(relative).canonicalize() else {
        return HttpResponse::new(404);
    };
    if !target.starts_with(&root) {
        return HttpResponse::new(404);
    }

    if target.is_dir() {
        // Redirect directory URLs missing the trailing slash so the
        // browser resolves relative links correctly.
        if !url.ends_with('/') {
            let mut response = HttpResponse::new(301);
            response.extra_header = Some(format!("Location: {url}/"));
            return response;
        }
        target = target.join(INDEX_FILE);
    }

    match std::fs::read(&target) {
        Ok(body) => HttpResponse::with_body(200, mime_type(&target), body),
        Err(_) => HttpResponse::new(404),
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "text/plain",
    }
}
