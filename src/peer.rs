use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::QsResult;

const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Literal control-payload prefix defined by `spec.md` §6.5.
const REQUEST_STREAMS_PREFIX: &str = "REQUEST_STREAMS:";

/// Initiator entry point (`spec.md` §4.5): handshakes, requests `num_streams`
/// streams, pre-creates empty receiver streams, then polls `recv_control`
/// and the connection until it closes. Returns the connection so the caller
/// (the `qstream-client` binary) can read back stream contents and stats.
pub async fn run_initiator(
    remote_addr: SocketAddr,
    num_streams: u32,
    config: ConnectionConfig,
) -> QsResult<Arc<Connection>> {
    let conn = Connection::connect(remote_addr, config).await?;

    conn.send_control(Bytes::from(format!("{REQUEST_STREAMS_PREFIX}{num_streams}")))
        .await?;
    for stream_id in 1..=num_streams {
        conn.add_receiver_stream(stream_id).await;
    }

    while !conn.is_closed().await {
        if let Some(frame) = conn.recv_control().await {
            tracing::info!(stream_id = frame.stream_id, len = frame.length(), "control frame received");
        }
        tokio::time::sleep(CONTROL_POLL_INTERVAL).await;
    }

    Ok(conn)
}

/// Responder entry point (`spec.md` §4.5): listens for a handshake, then
/// waits for a `REQUEST_STREAMS:<N>` control frame and opens `N` sender
/// streams, each bound to a byte source obtained from `load_source` (kept
/// generic so the core never depends on file I/O directly — `spec.md` §1
/// scopes file access as an external collaborator).
pub async fn run_responder<F, Fut>(
    local_addr: SocketAddr,
    config: ConnectionConfig,
    mut load_source: F,
) -> QsResult<Arc<Connection>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = QsResult<Bytes>>,
{
    let conn = Connection::listen(local_addr, config).await?;

    while !conn.is_closed().await {
        if let Some(frame) = conn.recv_control().await {
            if let Some(count) = parse_request_streams(&frame.data) {
                tracing::info!(count, "stream request received");
                for stream_id in 1..=count {
                    match load_source(stream_id).await {
                        Ok(source) => conn.add_sender_stream(stream_id, source).await,
                        Err(e) => {
                            tracing::warn!(stream_id, error = %e, "failed to load source for stream");
                        }
                    }
                }
            } else {
                tracing::info!(len = frame.data.len(), "non-control-protocol payload received verbatim");
            }
        }
        tokio::time::sleep(CONTROL_POLL_INTERVAL).await;
    }

    Ok(conn)
}

fn parse_request_streams(payload: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(payload).ok()?;
    let count = text.strip_prefix(REQUEST_STREAMS_PREFIX)?;
    count.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_request() {
        assert_eq!(parse_request_streams(b"REQUEST_STREAMS:4"), Some(4));
    }

    #[test]
    fn rejects_other_payloads() {
        assert_eq!(parse_request_streams(b"hello"), None);
        assert_eq!(parse_request_streams(b"REQUEST_STREAMS:not-a-number"), None);
    }
}
