use anyhow::{Context, Result, bail};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Printed on stdout by `serve-dir` once the listener is bound.
pub const READY_LINE_PREFIX: &str = "crawlbed-serve listening on ";

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticServerConfig {
    pub host: String,
    pub port: u16,
    pub root_dir: PathBuf,
}

pub struct StaticServerHandle {
    pub config: StaticServerConfig,
    pub url: String,
    stop_tx: mpsc::Sender<()>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl StaticServerHandle {
    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn ready_line(&self) -> String {
        format!("{READY_LINE_PREFIX}{}", self.url)
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }

    /// Blocks until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StaticServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "webmanifest" => "application/manifest+json",
        "xml" => "application/xml; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// One response per connection; the server always closes afterwards.
#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn file(path: &Path, body: Vec<u8>) -> Self {
        Self {
            status: "200 OK",
            content_type: guess_content_type(path),
            body,
        }
    }

    /// Status-only response; the reason phrase is sent as a plain-text body.
    fn status(status: &'static str) -> Self {
        let reason = status.split_once(' ').map_or(status, |(_, reason)| reason);
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: reason.as_bytes().to_vec(),
        }
    }

    fn send(&self, stream: &mut impl Write, head_only: bool) -> io::Result<()> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        write!(
            out,
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.content_type,
            self.body.len()
        )?;
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        stream.write_all(&out)?;
        stream.flush()
    }
}

fn percent_decode(input: &str) -> Option<String> {
    let mut bytes = input.bytes();
    let mut out = Vec::with_capacity(input.len());
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let high = char::from(bytes.next()?).to_digit(16)?;
        let low = char::from(bytes.next()?).to_digit(16)?;
        out.push(u8::try_from(high * 16 + low).ok()?);
    }
    String::from_utf8(out).ok()
}

/// Maps a request target onto a path under `root`, or the error response to send instead.
fn lookup(root: &Path, target: &str) -> Result<PathBuf, Response> {
    let path = target.split(['?', '#']).next().unwrap_or("/");
    let decoded = percent_decode(path).ok_or_else(|| Response::status("400 Bad Request"))?;

    let mut resolved = root.to_path_buf();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(Response::status("400 Bad Request")),
            hidden if hidden.starts_with('.') => return Err(Response::status("404 Not Found")),
            name => resolved.push(name),
        }
    }
    Ok(resolved)
}

fn respond(root: &Path, method: &str, target: &str) -> Response {
    if !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("HEAD") {
        return Response::status("405 Method Not Allowed");
    }
    let mut path = match lookup(root, target) {
        Ok(path) => path,
        Err(response) => return response,
    };
    if path.is_dir() {
        path.push("index.html");
    }
    match fs::read(&path) {
        Ok(body) => Response::file(&path, body),
        Err(err) => {
            debug!(path = %path.display(), "not served: {err}");
            Response::status("404 Not Found")
        }
    }
}

fn handle_connection(mut stream: TcpStream, root: &Path) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut buffer = [0_u8; 16_384];
    let read = stream.read(&mut buffer)?;
    if read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..read]);
    let mut request_line = request.lines().next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Response::status("400 Bad Request").send(&mut stream, false);
    };
    debug!(method, path = target, "request");

    let head_only = method.eq_ignore_ascii_case("HEAD");
    respond(root, method, target).send(&mut stream, head_only)
}

fn accept_loop(listener: TcpListener, root: PathBuf, stop_rx: mpsc::Receiver<()>) {
    while let Err(mpsc::TryRecvError::Empty) = stop_rx.try_recv() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, &root) {
                    warn!(%peer, "static server request failed: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                warn!("static server listener failed: {err}");
                thread::sleep(POLL_INTERVAL * 2);
            }
        }
    }
}

/// Binds `host:port` (port 0 picks a free one) and serves `root_dir` on a background thread.
pub fn start_static_server(config: &StaticServerConfig) -> Result<StaticServerHandle> {
    let root_dir = config.root_dir.canonicalize().with_context(|| {
        format!(
            "failed resolving site root directory {}",
            config.root_dir.display()
        )
    })?;
    if !root_dir.is_dir() {
        bail!("site root '{}' is not a directory", root_dir.display());
    }

    let listener = TcpListener::bind((config.host.as_str(), config.port)).with_context(|| {
        format!(
            "failed binding static server on {}:{}",
            config.host, config.port
        )
    })?;
    listener
        .set_nonblocking(true)
        .context("failed switching the listener to nonblocking")?;
    let port = listener
        .local_addr()
        .context("failed reading the bound address")?
        .port();

    let served = StaticServerConfig {
        host: config.host.clone(),
        port,
        root_dir,
    };
    let url = format!("http://{}:{port}/", served.host);
    debug!(%url, root = %served.root_dir.display(), "static server started");

    let (stop_tx, stop_rx) = mpsc::channel();
    let root = served.root_dir.clone();
    let join_handle = thread::spawn(move || accept_loop(listener, root, stop_rx));

    Ok(StaticServerHandle {
        config: served,
        url,
        stop_tx,
        join_handle: Some(join_handle),
    })
}
