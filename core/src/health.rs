//! Liveness signal for the managed service: a short-timeout TCP connect.
//!
//! Both execution strategies use the same probe, so "running" means the same
//! thing regardless of how the service was launched.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

/// True if something accepts TCP connections on 127.0.0.1:`port`.
pub async fn probe(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Polls until nothing accepts connections on the port, or `deadline`
/// elapses. Returns true once the port is closed; there is no indefinite
/// blocking anywhere in a lifecycle transition.
pub async fn wait_unreachable(port: u16, deadline: Duration, poll_interval: Duration) -> bool {
    let until = Instant::now() + deadline;
    loop {
        if !probe(port).await {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        sleep(poll_interval).await;
    }
}
