//! Built-in HTTP service body.
//!
//! Both execution paths run this loop: the unprivileged strategy on a worker
//! thread via [`DemoService`], and the privileged strategy in the spawned
//! `serve` process. It answers any request with 200 and exits when the
//! shutdown endpoint is hit with the right token.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use berth_core::RuntimeConfig;
use berth_core::ServiceEntry;
use berth_core::strategy::SHUTDOWN_PATH;
use tracing::debug;
use tracing::info;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Serves until `shutdown` is set, either externally or by the shutdown
/// endpoint. `entry` must exist; its content stands in for a real payload.
pub fn serve_blocking(
    entry: &Path,
    port: u16,
    token: &str,
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    std::fs::metadata(entry)?;
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    listener.set_nonblocking(true)?;
    info!(port, "service listening");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, token, shutdown) {
                    debug!("connection error: {err}");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => return Err(err),
        }
    }
    info!(port, "service shutting down");
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    token: &str,
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut stream = reader.into_inner();

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    if path == SHUTDOWN_PATH {
        if token_matches(query, token) {
            respond(&mut stream, "200 OK", "bye\n")?;
            shutdown.store(true, Ordering::SeqCst);
        } else {
            respond(&mut stream, "403 Forbidden", "bad token\n")?;
        }
        return Ok(());
    }
    respond(&mut stream, "200 OK", "ok\n")
}

fn token_matches(query: &str, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    query
        .split('&')
        .any(|pair| pair.strip_prefix("token=") == Some(token))
}

fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// In-process entry for the unprivileged strategy.
pub struct DemoService {
    entry: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl DemoService {
    pub fn new(entry: PathBuf) -> Self {
        Self {
            entry,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ServiceEntry for DemoService {
    fn run(
        &self,
        config: &RuntimeConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The same instance serves every restart; clear the previous stop.
        self.shutdown.store(false, Ordering::SeqCst);
        serve_blocking(&self.entry, config.port, &config.token, &self.shutdown)?;
        Ok(())
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;

    fn request(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        write!(stream, "GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n").expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read");
        response
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local addr").port()
    }

    fn wait_reachable(port: u16) {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("service never came up on port {port}");
    }

    #[test]
    fn answers_requests_and_stops_on_the_shutdown_endpoint() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let entry = dir.path().join("main.js");
        std::fs::write(&entry, "// entry").expect("write entry");

        let port = free_port();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let server = std::thread::spawn(move || {
            serve_blocking(&entry, port, "secret", &flag).expect("serve");
        });
        wait_reachable(port);

        assert!(request(port, "/").starts_with("HTTP/1.1 200"));
        assert!(request(port, "/-/shutdown?token=wrong").starts_with("HTTP/1.1 403"));
        assert!(request(port, "/-/shutdown?token=secret").starts_with("HTTP/1.1 200"));
        server.join().expect("server thread");
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn external_shutdown_request_stops_the_loop() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let entry = dir.path().join("main.js");
        std::fs::write(&entry, "// entry").expect("write entry");

        let port = free_port();
        let service = Arc::new(DemoService::new(entry));
        let runner = Arc::clone(&service);
        let config = RuntimeConfig {
            port,
            ..RuntimeConfig::default()
        };
        let server = std::thread::spawn(move || runner.run(&config).map_err(|e| e.to_string()));
        wait_reachable(port);

        service.request_shutdown();
        server.join().expect("server thread").expect("clean exit");
    }

    #[test]
    fn missing_entry_file_is_an_error() {
        let shutdown = AtomicBool::new(false);
        let err = serve_blocking(Path::new("/nonexistent/main.js"), 0, "", &shutdown)
            .expect_err("entry must exist");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
