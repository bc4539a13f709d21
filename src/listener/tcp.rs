use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::udp::trim_line_ending;
use super::{MAX_MESSAGE_SIZE, Shared};

pub(super) fn bind(address: SocketAddr) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

pub(super) async fn run(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(port = shared.port, peer = %peer, "TCP connection accepted");
                    let shared = Arc::clone(&shared);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &shared, &cancel).await
                            && !is_connection_reset(&e)
                        {
                            tracing::debug!(peer = %peer, error = %e, "TCP connection error");
                        }
                    });
                }
                Err(e) => tracing::warn!(port = shared.port, error = %e, "TCP accept error"),
            }
        }
    }

    tracing::debug!(port = shared.port, "TCP accept loop stopped");
}

/// Routes every newline-delimited line of one connection by its peer IP.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(1024);

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = read_bounded_line(&mut reader, &mut line, MAX_MESSAGE_SIZE) => read?,
        };

        match read {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => {
                tracing::debug!(peer = %peer, max = MAX_MESSAGE_SIZE, "Line too long, dropped");
            }
            LineRead::Line => {
                let data = trim_line_ending(&line);
                if !data.is_empty() {
                    shared.dispatch(data, peer.ip());
                }
            }
        }
    }
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Reads one line into `buf` without ever holding more than `max_size` bytes.
/// An oversized line is consumed up to its newline and reported as `TooLong`.
async fn read_bounded_line<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
) -> io::Result<LineRead> {
    buf.clear();
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() && !too_long {
                return Ok(LineRead::Eof);
            }
            break;
        }

        let (take, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        if !too_long {
            if buf.len() + take <= max_size {
                buf.extend_from_slice(&available[..take]);
            } else {
                too_long = true;
                buf.clear();
            }
        }
        reader.consume(take);

        if done {
            break;
        }
    }

    Ok(if too_long { LineRead::TooLong } else { LineRead::Line })
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
