//! Shared helpers for integration tests.
//!
//! [`RangeServer`] is a minimal HTTP/1.1 server over a raw TCP listener.
//! It serves one in-memory file under any path, honours `Range` headers and
//! can inject faults: truncated bodies, stalled bodies, `403` on expired
//! paths and redirects. Every request is recorded for later inspection.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long a stalled response waits for the client to hang up.
const STALL_LIMIT: Duration = Duration::from_secs(10);

/// One request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: String,
    pub path: String,
    /// Inclusive bounds from the `Range` header.
    pub range: Option<(u64, u64)>,
    pub referer: Option<String>,
}

#[derive(Default)]
struct Faults {
    /// Paths answering every GET with 403.
    expired: Vec<String>,
    /// Path -> redirect target.
    redirects: HashMap<String, String>,
    /// Leave `Content-Length` off HEAD responses.
    omit_length: bool,
}

struct State {
    content: Vec<u8>,
    faults: Mutex<Faults>,
    truncate_remaining: AtomicUsize,
    stall_remaining: AtomicUsize,
    released_stalls: AtomicUsize,
    requests: Mutex<Vec<LoggedRequest>>,
    body_bytes: AtomicU64,
}

/// A fault-injecting range server bound to localhost.
#[derive(Clone)]
pub struct RangeServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl RangeServer {
    /// Serve `content` on an ephemeral port.
    pub fn start(content: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State {
            content,
            faults: Mutex::new(Faults::default()),
            truncate_remaining: AtomicUsize::new(0),
            stall_remaining: AtomicUsize::new(0),
            released_stalls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            body_bytes: AtomicU64::new(0),
        });

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = accept_state.clone();
                thread::spawn(move || handle(stream, &state));
            }
        });

        Self { addr, state }
    }

    /// URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Cut the body of the next `n` range responses in half.
    pub fn truncate_next(&self, n: usize) {
        self.state.truncate_remaining.store(n, Ordering::SeqCst);
    }

    /// Send half the body of the next `n` range responses, then go silent
    /// while keeping the connection open.
    pub fn stall_next(&self, n: usize) {
        self.state.stall_remaining.store(n, Ordering::SeqCst);
    }

    /// Stalled connections the client has closed.
    pub fn released_stalls(&self) -> usize {
        self.state.released_stalls.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for `n` stalled connections to be closed.
    pub fn wait_for_released_stalls(&self, n: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.released_stalls() < n {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    /// Answer every GET on `path` with 403.
    pub fn expire(&self, path: &str) {
        self.state.faults.lock().unwrap().expired.push(path.to_string());
    }

    /// Redirect requests for `from` to `to`.
    pub fn redirect(&self, from: &str, to: &str) {
        self.state
            .faults
            .lock()
            .unwrap()
            .redirects
            .insert(from.to_string(), to.to_string());
    }

    /// Send HEAD responses without `Content-Length`.
    pub fn omit_length(&self) {
        self.state.faults.lock().unwrap().omit_length = true;
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Ranged GETs that were answered with 206.
    pub fn served_ranges(&self, path: &str) -> Vec<(u64, u64)> {
        let expired = self.state.faults.lock().unwrap().expired.clone();
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.path == path && !expired.contains(&r.path))
            .filter_map(|r| r.range)
            .collect()
    }

    /// Body bytes written to clients.
    pub fn body_bytes(&self) -> u64 {
        self.state.body_bytes.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (lower, upper) = spec.split_once('-')?;
    Some((lower.trim().parse().ok()?, upper.trim().parse().ok()?))
}

fn handle(stream: TcpStream, state: &State) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut range = None;
    let mut referer = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "range" => range = parse_range(value),
                "referer" => referer = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    state.requests.lock().unwrap().push(LoggedRequest {
        method: method.clone(),
        path: path.clone(),
        range,
        referer,
    });

    let (redirect, expired, omit_length) = {
        let faults = state.faults.lock().unwrap();
        (
            faults.redirects.get(&path).cloned(),
            faults.expired.contains(&path),
            faults.omit_length,
        )
    };

    let mut stream = stream;
    let total = state.content.len() as u64;

    if let Some(target) = redirect {
        respond(&mut stream, "302 Found", &[("Location", target), ("Content-Length", "0".into())], &[]);
        return;
    }

    if method == "HEAD" {
        let mut headers = vec![("Accept-Ranges", "bytes".to_string())];
        if !omit_length {
            headers.push(("Content-Length", total.to_string()));
        }
        respond(&mut stream, "200 OK", &headers, &[]);
        return;
    }

    if expired {
        respond(&mut stream, "403 Forbidden", &[("Content-Length", "0".into())], &[]);
        return;
    }

    match range {
        Some((lower, upper)) if lower <= upper && upper < total => {
            let body = &state.content[lower as usize..=upper as usize];
            let headers = [
                ("Content-Range", format!("bytes {}-{}/{}", lower, upper, total)),
                ("Content-Length", body.len().to_string()),
            ];

            let stall = state
                .stall_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stall {
                let sent = &body[..body.len() / 2];
                state.body_bytes.fetch_add(sent.len() as u64, Ordering::SeqCst);
                write_response(&mut stream, "206 Partial Content", &headers, sent);
                if wait_for_hangup(&mut stream) {
                    state.released_stalls.fetch_add(1, Ordering::SeqCst);
                }
                return;
            }

            let truncate = state
                .truncate_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let sent = if truncate { &body[..body.len() / 2] } else { body };

            state.body_bytes.fetch_add(sent.len() as u64, Ordering::SeqCst);
            respond(&mut stream, "206 Partial Content", &headers, sent);
        }
        Some(_) => {
            respond(
                &mut stream,
                "416 Range Not Satisfiable",
                &[("Content-Length", "0".into())],
                &[],
            );
        }
        None => {
            state.body_bytes.fetch_add(total, Ordering::SeqCst);
            respond(
                &mut stream,
                "200 OK",
                &[("Content-Length", total.to_string())],
                &state.content,
            );
        }
    }
}

fn respond(stream: &mut TcpStream, status: &str, headers: &[(&str, String)], body: &[u8]) {
    write_response(stream, status, headers, body);
    let _ = stream.shutdown(Shutdown::Both);
}

fn write_response(stream: &mut TcpStream, status: &str, headers: &[(&str, String)], body: &[u8]) {
    let mut head = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

/// Block until the client closes the connection. `false` if it never did.
fn wait_for_hangup(stream: &mut TcpStream) -> bool {
    if stream.set_read_timeout(Some(STALL_LIMIT)).is_err() {
        return false;
    }
    let mut buffer = [0u8; 256];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
}

/// Deterministic pseudo-random bytes.
pub fn content(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
