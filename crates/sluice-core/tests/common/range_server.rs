//! Minimal HTTP/1.1 object server for integration tests.
//!
//! Serves a fixed set of objects from one bucket the way the JSON API does:
//! ranged media GETs on `/download/storage/v1/b/{bucket}/o/{object}?alt=media`
//! (206 for ranges, 416 past the end) and one-page listings on
//! `/storage/v1/b/{bucket}/o?prefix=...`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeServerOptions {
    /// The first media GET sends only this many body bytes, then closes the
    /// connection while the client still expects the rest.
    pub cut_first_get_after: Option<usize>,
    /// Every request must carry this header (name, value) or gets a 401.
    pub require_header: Option<(&'static str, &'static str)>,
}

pub struct RangeServer {
    pub endpoint: String,
    pub bucket: String,
    media_gets: Arc<AtomicUsize>,
}

impl RangeServer {
    /// Number of media GETs served so far.
    pub fn media_gets(&self) -> usize {
        self.media_gets.load(Ordering::SeqCst)
    }
}

struct State {
    bucket: String,
    objects: BTreeMap<String, Vec<u8>>,
    opts: RangeServerOptions,
    cut_done: AtomicBool,
    media_gets: Arc<AtomicUsize>,
}

/// Starts a server in a background thread serving `objects` (name, body) in
/// `bucket`. The server runs until the process exits.
pub fn start(bucket: &str, objects: Vec<(&str, Vec<u8>)>) -> RangeServer {
    start_with_options(bucket, objects, RangeServerOptions::default())
}

pub fn start_with_options(
    bucket: &str,
    objects: Vec<(&str, Vec<u8>)>,
    opts: RangeServerOptions,
) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let media_gets = Arc::new(AtomicUsize::new(0));
    let state = Arc::new(State {
        bucket: bucket.to_string(),
        objects: objects
            .into_iter()
            .map(|(name, body)| (name.to_string(), body))
            .collect(),
        opts,
        cut_done: AtomicBool::new(false),
        media_gets: Arc::clone(&media_gets),
    });
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let state = Arc::clone(&state);
            thread::spawn(move || handle(stream, &state));
        }
    });
    RangeServer {
        endpoint: format!("http://127.0.0.1:{}/", port),
        bucket: bucket.to_string(),
        media_gets,
    }
}

fn handle(mut stream: std::net::TcpStream, state: &State) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    if let Some((name, value)) = state.opts.require_header {
        if !has_header(request, name, value) {
            let _ = stream.write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
    }
    let (method, target, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        return;
    }
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let media_prefix = format!("/download/storage/v1/b/{}/o/", state.bucket);
    let list_path = format!("/storage/v1/b/{}/o", state.bucket);
    if let Some(encoded) = path.strip_prefix(&media_prefix) {
        serve_media(&mut stream, state, &percent_decode(encoded), range);
    } else if path == list_path {
        let prefix = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == "prefix")
            .map(|(_, v)| percent_decode(v))
            .unwrap_or_default();
        serve_listing(&mut stream, state, &prefix);
    } else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
    }
}

fn serve_media(stream: &mut std::net::TcpStream, state: &State, name: &str, range: Option<(u64, u64)>) {
    state.media_gets.fetch_add(1, Ordering::SeqCst);
    let Some(body) = state.objects.get(name) else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        return;
    };
    let total = body.len() as u64;
    let (status, range_header, slice) = match range {
        Some((start, end_incl)) => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start >= total || start > end_incl {
                (
                    "416 Range Not Satisfiable",
                    format!("bytes */{}", total),
                    &body[0..0],
                )
            } else {
                let slice = &body[start as usize..=end_incl as usize];
                (
                    "206 Partial Content",
                    format!("bytes {}-{}/{}", start, end_incl, total),
                    slice,
                )
            }
        }
        None => (
            "200 OK",
            format!("bytes 0-{}/{}", total.saturating_sub(1), total),
            &body[..],
        ),
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Range: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        status,
        slice.len(),
        range_header
    );
    let _ = stream.write_all(response.as_bytes());
    let cut = match state.opts.cut_first_get_after {
        Some(n) if n < slice.len() && !state.cut_done.swap(true, Ordering::SeqCst) => n,
        _ => slice.len(),
    };
    let _ = stream.write_all(&slice[..cut]);
    let _ = stream.flush();
}

fn serve_listing(stream: &mut std::net::TcpStream, state: &State, prefix: &str) {
    let items: Vec<serde_json::Value> = state
        .objects
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, body)| {
            serde_json::json!({
                "name": name,
                "size": body.len().to_string(),
                "md5Hash": STANDARD.encode(md5::compute(body).0),
                "crc32c": STANDARD.encode(crc32c::crc32c(body).to_be_bytes()),
                "generation": "1",
            })
        })
        .collect();
    let json = serde_json::json!({ "kind": "storage#objects", "items": items }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        json.len(),
        json
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Returns (method, request target, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut method = "";
    let mut target = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            target = parts.next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, target, range)
}

fn has_header(request: &str, name: &str, value: &str) -> bool {
    request
        .lines()
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .any(|(n, v)| n.trim().eq_ignore_ascii_case(name) && v.trim() == value)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
