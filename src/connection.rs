use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, PACKET_H_MAX_SIZE};
use crate::error::{QsError, QsResult};
use crate::frame::{Frame, ACK, CLOSE, HANDSHAKE};
use crate::packet::{Header, Packet};
use crate::stream::Stream;

/// `spec.md` §4.4: `Fresh → Handshaking → Established → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Fresh,
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Statistics snapshot for one stream, exposed to the ambient
/// statistics/reporting layer (out of core scope, see `src/stats.rs`).
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub stream_id: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub closed: bool,
    pub elapsed: Option<Duration>,
}

struct Shared {
    remote_addr: Option<SocketAddr>,
    remote_con_id: Option<u16>,
    streams: HashMap<u32, Stream>,
    stream_order: Vec<u32>,
    packet_number: u32,
    seen_packet_numbers: HashSet<u32>,
    control_rx_queue: VecDeque<Frame>,
    state: ConnectionState,
    bytes_sent: u64,
    bytes_received: u64,
    stime: Option<Instant>,
    etime: Option<Instant>,
}

impl Shared {
    fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            remote_con_id: None,
            streams: HashMap::new(),
            stream_order: Vec::new(),
            packet_number: 0,
            seen_packet_numbers: HashSet::new(),
            control_rx_queue: VecDeque::new(),
            state: ConnectionState::Fresh,
            bytes_sent: 0,
            bytes_received: 0,
            stime: Some(Instant::now()),
            etime: None,
        }
    }
}

/// Treats `ConnectionRefused` (the ICMP port-unreachable the OS surfaces
/// once the remote disappears) as terminal: it should trigger local close
/// rather than a retry, matching `original_source/QuicConnection.py`'s
/// `except ConnectionRefusedError: await self.close()`.
fn is_terminal_socket_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::ConnectionRefused
}

/// Owns the UDP endpoint, the stream map, handshake state, the
/// packet-number counter, and the two background tasks (receiver, sender).
/// `socket` is shared outside the lock so the receiver and sender tasks
/// never block each other; `shared` guards everything both tasks (and the
/// application) can mutate. At most one task ever holds `shared` across an
/// await point, so the mutex is structural rather than a contention point.
pub struct Connection {
    socket: Arc<UdpSocket>,
    local_con_id: u16,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
}

impl Connection {
    /// Initiator side: sends a long-header HANDSHAKE packet to `remote_addr`
    /// and blocks until the handshake completes.
    pub async fn connect(remote_addr: SocketAddr, config: ConnectionConfig) -> QsResult<Arc<Connection>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(remote_addr).await?;
        let local_con_id: u16 = rand::thread_rng().gen();

        let conn = Arc::new(Connection {
            socket: Arc::new(socket),
            local_con_id,
            config,
            shared: Mutex::new(Shared::new(Some(remote_addr))),
        });

        {
            let mut shared = conn.shared.lock().await;
            shared.state = ConnectionState::Handshaking;
        }

        tracing::info!(local_con_id, %remote_addr, "initiating handshake");
        conn.emit_packet(
            Header::Long {
                src_con_id: local_con_id as u32,
                dest_con_id: 0,
            },
            0,
            vec![Frame::new(HANDSHAKE, 0, 0, Bytes::new())],
        )
        .await?;

        Connection::spawn_background_tasks(&conn);

        loop {
            {
                let shared = conn.shared.lock().await;
                if shared.remote_con_id.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::info!("handshake established (initiator)");

        Ok(conn)
    }

    /// Responder side: binds `local_addr`, waits for a single peer's
    /// handshake packet, replies with HANDSHAKE|ACK, and locks the
    /// endpoint to that peer's address. Later handshake attempts from
    /// other addresses are ignored (`spec.md` §9 Open Question a).
    pub async fn listen(local_addr: SocketAddr, config: ConnectionConfig) -> QsResult<Arc<Connection>> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_con_id: u16 = rand::thread_rng().gen();

        let conn = Arc::new(Connection {
            socket: Arc::new(socket),
            local_con_id,
            config,
            shared: Mutex::new(Shared::new(None)),
        });

        tracing::info!(local_con_id, %local_addr, "listening for handshake");
        let mut buf = vec![0u8; crate::config::MAX_PACKET_SIZE];
        loop {
            let (n, from) = conn.socket.recv_from(&mut buf).await?;
            let bytes = Bytes::copy_from_slice(&buf[..n]);
            let packet = match Packet::decode(bytes) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed pre-handshake datagram");
                    continue;
                }
            };
            if packet.header.header_form() != 1 {
                continue;
            }
            let Some(src) = packet.header.src_con_id() else {
                continue;
            };
            if !packet.frames.iter().any(|f| f.frame_type == HANDSHAKE) {
                continue;
            }

            conn.socket.connect(from).await?;
            {
                let mut shared = conn.shared.lock().await;
                shared.remote_con_id = Some(src as u16);
                shared.remote_addr = Some(from);
                shared.state = ConnectionState::Handshaking;
            }
            tracing::info!(remote_con_id = src, %from, "handshake request received");
            conn.emit_packet(
                Header::Long {
                    src_con_id: local_con_id as u32,
                    dest_con_id: src,
                },
                0,
                vec![Frame::new(HANDSHAKE | ACK, 0, 0, Bytes::new())],
            )
            .await?;
            {
                let mut shared = conn.shared.lock().await;
                shared.state = ConnectionState::Established;
            }
            break;
        }
        tracing::info!("handshake established (responder)");

        Connection::spawn_background_tasks(&conn);
        Ok(conn)
    }

    fn spawn_background_tasks(conn: &Arc<Connection>) {
        let recv_conn = conn.clone();
        tokio::spawn(async move { Connection::receiver_loop(recv_conn).await });
        let send_conn = conn.clone();
        tokio::spawn(async move { Connection::sender_loop(send_conn).await });
    }

    /// Builds a packet with the current `packet_number`, encodes and sends
    /// it, then advances the counter. Used for every one-off control
    /// packet (handshake, ack, close, stream-request); the scheduler uses
    /// its own inline copy of this sequencing for data packets so it can
    /// batch the round-robin frame selection under a single lock
    /// acquisition. `packet_number` is advanced here regardless of whether
    /// the send succeeds, per the convention documented in `DESIGN.md`.
    async fn emit_packet(&self, header: Header, flags: u8, frames: Vec<Frame>) -> QsResult<u32> {
        let (packet_number, bytes) = {
            let mut shared = self.shared.lock().await;
            let packet_number = shared.packet_number;
            let packet = Packet {
                header,
                flags,
                packet_number,
                frames,
            };
            let bytes = packet.encode();
            shared.packet_number += 1;
            shared.bytes_sent += bytes.len() as u64;
            (packet_number, bytes)
        };

        if bytes.len() > self.config.max_packet_size {
            tracing::warn!(len = bytes.len(), "outbound packet exceeds max_packet_size");
        }

        match self.socket.send(&bytes).await {
            Ok(_) => Ok(packet_number),
            Err(e) if is_terminal_socket_error(&e) => {
                tracing::warn!(error = %e, "remote refused connection");
                Err(QsError::RemoteRefused)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send packet");
                Err(QsError::Io(e))
            }
        }
    }

    async fn receiver_loop(conn: Arc<Connection>) {
        let mut buf = vec![0u8; crate::config::MAX_PACKET_SIZE];
        loop {
            {
                let shared = conn.shared.lock().await;
                if shared.state == ConnectionState::Closed {
                    break;
                }
            }

            match tokio::time::timeout(Duration::from_millis(50), conn.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let bytes = Bytes::copy_from_slice(&buf[..n]);
                    conn.handle_datagram(bytes).await;
                }
                Ok(Err(e)) if is_terminal_socket_error(&e) => {
                    tracing::warn!(error = %e, "remote refused connection, closing");
                    conn.begin_close().await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "receiver task socket error");
                }
                Err(_elapsed) => {
                    // no datagram within the poll window; loop back to
                    // re-check the closed flag.
                }
            }
        }
        tracing::debug!("receiver task exiting");
    }

    async fn sender_loop(conn: Arc<Connection>) {
        loop {
            let (closed, tick) = {
                let shared = conn.shared.lock().await;
                (shared.state == ConnectionState::Closed, conn.config.tick_interval)
            };
            if closed {
                break;
            }
            match conn.build_and_send_packet().await {
                Ok(()) => {}
                Err(QsError::RemoteRefused) => {
                    tracing::warn!("remote refused connection, closing");
                    conn.begin_close().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler tick failed to send packet");
                }
            }
            tokio::time::sleep(tick).await;
        }
        tracing::debug!("sender task exiting");
    }

    /// The fair round-robin scheduler (`spec.md` §4.4 Send path, `next_frame`
    /// pull). Packs at most one short-header packet per call: reserves the
    /// long-header worst-case overhead against `max_packet_size`, then
    /// repeatedly walks streams in insertion order pulling one frame each
    /// until a full pass pulls nothing. A frame that doesn't fit in the
    /// current packet is popped and discarded rather than requeued — see
    /// `spec.md` §9 resolution "scheduler frame-fit discards on miss",
    /// matching `original_source/QuicConnection.py`'s `send_packet`.
    async fn build_and_send_packet(&self) -> QsResult<()> {
        let mut shared = self.shared.lock().await;
        let Some(remote_con_id) = shared.remote_con_id else {
            return Ok(());
        };
        if shared.state != ConnectionState::Established {
            return Ok(());
        }

        let mut current_size = PACKET_H_MAX_SIZE;
        let mut outbound = Vec::new();
        let order = shared.stream_order.clone();

        loop {
            let mut added_this_round = false;
            for id in &order {
                if let Some(stream) = shared.streams.get_mut(id) {
                    if let Some(frame) = stream.next_frame() {
                        let frame_size = frame.length() + crate::config::FRAME_H_SIZE;
                        if current_size + frame_size <= self.config.max_packet_size {
                            current_size += frame_size;
                            outbound.push(frame);
                            added_this_round = true;
                        }
                        // else: frame is dropped on the floor, matching the
                        // original's behavior on an oversized-for-remaining-space frame.
                    }
                }
            }
            if !added_this_round {
                break;
            }
        }

        if outbound.is_empty() {
            return Ok(());
        }

        let packet_number = shared.packet_number;
        let packet = Packet::short(remote_con_id as u32, packet_number, outbound);
        let bytes = packet.encode();
        shared.packet_number += 1;
        shared.bytes_sent += bytes.len() as u64;
        drop(shared);

        match self.socket.send(&bytes).await {
            Ok(_) => Ok(()),
            Err(e) if is_terminal_socket_error(&e) => Err(QsError::RemoteRefused),
            Err(e) => Err(QsError::Io(e)),
        }
    }

    async fn handle_datagram(&self, bytes: Bytes) {
        let len = bytes.len();
        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed packet");
                return;
            }
        };

        if packet.header.header_form() == 1 {
            self.handle_long_header(packet).await;
            return;
        }

        if packet.header.dest_con_id() != self.local_con_id as u32 {
            tracing::warn!(
                got = packet.header.dest_con_id(),
                want = self.local_con_id,
                "dropping packet for foreign connection id"
            );
            return;
        }

        let mut shared = self.shared.lock().await;
        if !shared.seen_packet_numbers.insert(packet.packet_number) {
            tracing::debug!(packet_number = packet.packet_number, "dropping duplicate packet");
            return;
        }
        shared.bytes_received += len as u64;

        for frame in packet.frames {
            if frame.stream_id == 0 {
                if frame.frame_type & CLOSE != 0 {
                    tracing::info!("close frame received on control stream");
                    drop(shared);
                    self.begin_close().await;
                    return;
                }
                if frame.frame_type != ACK {
                    shared.control_rx_queue.push_back(frame);
                }
                continue;
            }

            match shared.streams.get_mut(&frame.stream_id) {
                Some(stream) => stream.deliver(frame),
                None => {
                    tracing::warn!(stream_id = frame.stream_id, "dropping frame for unknown stream");
                }
            }
        }

        let all_closed = !shared.streams.is_empty() && shared.streams.values().all(|s| s.is_closed());
        if all_closed && shared.etime.is_none() {
            shared.etime = Some(Instant::now());
        }
        drop(shared);

        if all_closed {
            tracing::info!("all streams closed, closing connection");
            self.begin_close().await;
        }
    }

    async fn handle_long_header(&self, packet: Packet) {
        let Some(src) = packet.header.src_con_id() else {
            return;
        };
        let is_handshake_ack = packet
            .frames
            .iter()
            .any(|f| f.frame_type == (HANDSHAKE | ACK));

        let mut shared = self.shared.lock().await;
        if is_handshake_ack && shared.remote_con_id.is_none() {
            shared.remote_con_id = Some(src as u16);
            shared.state = ConnectionState::Established;
            tracing::info!(remote_con_id = src, "handshake acknowledged (initiator)");
        } else {
            tracing::debug!("ignoring long-header packet outside handshake bootstrap");
        }
    }

    /// Sends a best-effort CLOSE packet, marks the connection `Closed`, and
    /// allows background tasks to exit at their next tick. Idempotent.
    async fn begin_close(&self) {
        let remote_con_id = {
            let mut shared = self.shared.lock().await;
            if matches!(shared.state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            shared.state = ConnectionState::Closing;
            shared.remote_con_id
        };

        if let Some(remote) = remote_con_id {
            let _ = self
                .emit_packet(
                    Header::Short {
                        dest_con_id: remote as u32,
                    },
                    0,
                    vec![Frame::close_frame(0, 0)],
                )
                .await;
        }

        let mut shared = self.shared.lock().await;
        shared.state = ConnectionState::Closed;
        if shared.etime.is_none() {
            shared.etime = Some(Instant::now());
        }
    }

    /// Initiates a local close. Safe to call multiple times.
    pub async fn close(&self) {
        self.begin_close().await;
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.lock().await.state == ConnectionState::Closed
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.lock().await.state
    }

    pub async fn remote_con_id(&self) -> Option<u16> {
        self.shared.lock().await.remote_con_id
    }

    pub fn local_con_id(&self) -> u16 {
        self.local_con_id
    }

    /// Enqueues and immediately transmits one stream-0 control frame,
    /// outside the data scheduler (`spec.md` §4.4 "Control frames").
    pub async fn send_control(&self, data: Bytes) -> QsResult<()> {
        let remote_con_id = self
            .remote_con_id()
            .await
            .ok_or(QsError::EndpointClosed)?;
        self.emit_packet(
            Header::Short {
                dest_con_id: remote_con_id as u32,
            },
            0,
            vec![Frame::data_frame(0, 0, data)],
        )
        .await?;
        Ok(())
    }

    /// Pops one control-stream frame delivered to the application, if any.
    pub async fn recv_control(&self) -> Option<Frame> {
        self.shared.lock().await.control_rx_queue.pop_front()
    }

    pub async fn add_receiver_stream(&self, stream_id: u32) {
        let mut shared = self.shared.lock().await;
        shared.stream_order.push(stream_id);
        shared.streams.insert(stream_id, Stream::new_receiver(stream_id));
    }

    pub async fn add_sender_stream(&self, stream_id: u32, source: Bytes) {
        let mut shared = self.shared.lock().await;
        shared.stream_order.push(stream_id);
        shared
            .streams
            .insert(stream_id, Stream::new_sender(stream_id, source));
    }

    pub async fn all_streams_closed(&self) -> bool {
        let shared = self.shared.lock().await;
        !shared.streams.is_empty() && shared.streams.values().all(|s| s.is_closed())
    }

    pub async fn stream_ids(&self) -> Vec<u32> {
        self.shared.lock().await.stream_order.clone()
    }

    pub async fn stream_received_data(&self, stream_id: u32) -> Option<Bytes> {
        self.shared
            .lock()
            .await
            .streams
            .get(&stream_id)
            .map(|s| Bytes::copy_from_slice(s.received_data()))
    }

    pub async fn stream_stats(&self, stream_id: u32) -> Option<StreamStats> {
        self.shared.lock().await.streams.get(&stream_id).map(|s| StreamStats {
            stream_id,
            bytes_sent: s.bytes_sent(),
            bytes_received: s.bytes_received(),
            frames_received: s.frames_received(),
            closed: s.is_closed(),
            elapsed: s.elapsed(),
        })
    }

    pub async fn bytes_sent(&self) -> u64 {
        self.shared.lock().await.bytes_sent
    }

    pub async fn bytes_received(&self) -> u64 {
        self.shared.lock().await.bytes_received
    }

    pub async fn elapsed(&self) -> Option<Duration> {
        let shared = self.shared.lock().await;
        match (shared.stime, shared.etime) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            tick_interval: Duration::from_millis(1),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn handshake_sets_remote_con_id_on_both_sides() {
        // S5
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let probe = TokioUdpSocket::bind(bind_addr).await.unwrap();
        let server_addr = probe.local_addr().unwrap();
        drop(probe);

        let server_task = tokio::spawn(Connection::listen(server_addr, fast_config()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let client = Connection::connect(server_addr, fast_config()).await.unwrap();
        let server = server_task.await.unwrap().unwrap();

        assert_eq!(client.remote_con_id().await, Some(server.local_con_id()));
        assert_eq!(server.remote_con_id().await, Some(client.local_con_id()));
        assert_eq!(client.state().await, ConnectionState::Established);
        assert_eq!(server.state().await, ConnectionState::Established);
    }

    #[tokio::test]
    async fn scheduler_is_fair_across_streams() {
        // S6: 4 streams each with 100 equal-size frames; after 25 ticks the
        // spread between any two streams' contributed frame counts is <= 1.
        let socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(sink.local_addr().unwrap()).await.unwrap();

        let conn = Connection {
            socket: Arc::new(socket),
            local_con_id: 1,
            config: fast_config(),
            shared: Mutex::new(Shared::new(Some(sink.local_addr().unwrap()))),
        };
        {
            let mut shared = conn.shared.lock().await;
            shared.remote_con_id = Some(2);
            shared.state = ConnectionState::Established;
            for id in 1..=4u32 {
                let mut stream = Stream::new_receiver(id);
                for _ in 0..100 {
                    stream.push_test_frame(Frame::data_frame(id, 0, Bytes::from(vec![0u8; 100])));
                }
                shared.stream_order.push(id);
                shared.streams.insert(id, stream);
            }
        }

        for _ in 0..25 {
            conn.build_and_send_packet().await.unwrap();
        }

        let shared = conn.shared.lock().await;
        let counts: Vec<u64> = (1..=4u32)
            .map(|id| shared.streams[&id].frames_sent())
            .collect();
        let min = *counts.iter().min().unwrap();
        let max = *counts.iter().max().unwrap();
        assert!(max - min <= 1, "unfair scheduling: {:?}", counts);
    }

    #[tokio::test]
    async fn packet_numbers_are_strictly_increasing() {
        let socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(sink.local_addr().unwrap()).await.unwrap();

        let conn = Connection {
            socket: Arc::new(socket),
            local_con_id: 1,
            config: fast_config(),
            shared: Mutex::new(Shared::new(Some(sink.local_addr().unwrap()))),
        };
        {
            let mut shared = conn.shared.lock().await;
            shared.remote_con_id = Some(2);
            shared.state = ConnectionState::Established;
        }

        let first = conn
            .emit_packet(Header::Short { dest_con_id: 2 }, 0, vec![])
            .await
            .unwrap();
        let second = conn
            .emit_packet(Header::Short { dest_con_id: 2 }, 0, vec![])
            .await
            .unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn duplicate_packet_numbers_are_delivered_at_most_once() {
        let socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection {
            socket: Arc::new(socket),
            local_con_id: 42,
            config: fast_config(),
            shared: Mutex::new(Shared::new(None)),
        };
        {
            let mut shared = conn.shared.lock().await;
            shared.remote_con_id = Some(7);
            shared.stream_order.push(1);
            shared.streams.insert(1, Stream::new_receiver(1));
        }

        let frame = Frame::data_frame(1, 0, Bytes::from_static(b"hi"));
        let packet = Packet::short(42, 5, vec![frame]);
        let bytes = packet.encode();

        conn.handle_datagram(bytes.clone()).await;
        conn.handle_datagram(bytes).await;

        let shared = conn.shared.lock().await;
        assert_eq!(shared.streams[&1].frames_received(), 1);
    }
}
