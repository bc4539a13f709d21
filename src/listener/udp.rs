use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{MAX_MESSAGE_SIZE, Shared};

/// Binds synchronously so bind failures surface to the caller of `start`.
pub(super) fn bind(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(address)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

pub(super) async fn run(socket: UdpSocket, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => {
                    let data = trim_line_ending(&buf[..len]);
                    if !data.is_empty() {
                        shared.dispatch(data, peer.ip());
                    }
                }
                // ICMP errors and the like surface here; the socket is still usable.
                Err(e) => tracing::debug!(port = shared.port, error = %e, "UDP recv error"),
            }
        }
    }

    tracing::debug!(port = shared.port, "UDP read loop stopped");
}

pub(super) fn trim_line_ending(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &data[..end]
}
