//! Top-level wiring: one cooperative event loop per process driving the
//! endpoint, session table, stream tables, and rate balancer together
//! (SPEC_FULL.md §4.7/§5). Mirrors the original's single-threaded
//! reactor model -- all mutation happens from inside `Transport::run`,
//! so none of the state here needs a lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::balancer::RateBalancer;
use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};
use crate::session::SessionTable;
use crate::stream::recv::RecvStream;
use crate::stream::send::SendStream;
use crate::stream::{Consumer, Producer, StreamState};
use crate::wire::{AckDatagram, Datagram};

/// Builds the consumer that will absorb bytes for a newly observed
/// inbound stream. Invoked the first time a DATA datagram names a
/// `stream_id` this endpoint hasn't seen before.
pub type ConsumerFactory =
    Box<dyn Fn(u32, u32, SocketAddr) -> Box<dyn Consumer> + Send + 'static>;

enum Command {
    OpenSend {
        peer_addr: SocketAddr,
        total_size: u32,
        producer: Box<dyn Producer>,
        reply: oneshot::Sender<u32>,
    },
    SendData {
        stream_id: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<TransportResult<()>>,
    },
    CloseStream {
        stream_id: u32,
    },
}

/// Cloneable front door to a running `Transport`. Every call here
/// crosses the command channel into the single event loop; nothing on
/// this handle touches shared state directly.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Command>,
}

impl TransportHandle {
    pub async fn open_send(
        &self,
        peer_addr: SocketAddr,
        total_size: u32,
        producer: Box<dyn Producer>,
    ) -> TransportResult<u32> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::OpenSend {
                peer_addr,
                total_size,
                producer,
                reply,
            })
            .await
            .map_err(|_| TransportError::MalformedDatagram("transport loop stopped".into()))?;
        rx.await
            .map_err(|_| TransportError::MalformedDatagram("transport loop stopped".into()))
    }

    pub async fn send_data(&self, stream_id: u32, data: Vec<u8>) -> TransportResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SendData {
                stream_id,
                data,
                reply,
            })
            .await
            .map_err(|_| TransportError::MalformedDatagram("transport loop stopped".into()))?;
        rx.await
            .map_err(|_| TransportError::MalformedDatagram("transport loop stopped".into()))?
    }

    pub async fn close_stream(&self, stream_id: u32) {
        let _ = self.tx.send(Command::CloseStream { stream_id }).await;
    }
}

struct SendEntry {
    peer_addr: SocketAddr,
    stream: SendStream,
}

struct RecvEntry {
    peer_addr: SocketAddr,
    stream: RecvStream,
}

/// An outbound file ticket queued until its session reaches CONNECTED
/// (SPEC_FULL.md §3/§4.3), holding everything `SendStream::new` needs.
struct PendingSend {
    peer_addr: SocketAddr,
    total_size: u32,
    producer: Box<dyn Producer>,
}

pub struct Transport {
    endpoint: Endpoint,
    config: TransportConfig,
    local_id: String,
    local_url: String,
    consumer_factory: ConsumerFactory,

    sessions: SessionTable,
    send_streams: HashMap<u32, SendEntry>,
    recv_streams: HashMap<u32, RecvEntry>,
    pending_sends: HashMap<u32, PendingSend>,
    balancer: RateBalancer,
    next_stream_id: u32,

    cmd_rx: mpsc::Receiver<Command>,
}

impl Transport {
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        local_id: impl Into<String>,
        local_url: impl Into<String>,
        consumer_factory: ConsumerFactory,
    ) -> TransportResult<(Self, TransportHandle)> {
        let endpoint = Endpoint::bind(addr).await?;
        let (tx, cmd_rx) = mpsc::channel(256);
        let balancer = RateBalancer::new(
            config.global_out_limit_bytes_per_sec,
            config.global_in_limit_bytes_per_sec,
        );
        let transport = Self {
            endpoint,
            config,
            local_id: local_id.into(),
            local_url: local_url.into(),
            consumer_factory,
            sessions: SessionTable::new(),
            send_streams: HashMap::new(),
            recv_streams: HashMap::new(),
            pending_sends: HashMap::new(),
            balancer,
            next_stream_id: 1,
            cmd_rx,
        };
        Ok((transport, TransportHandle { tx }))
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Mirrors the original's `get_by_peer_id` lookup; `None` until the
    /// peer's GREETING has been received.
    pub fn session_by_peer_id(&self, peer_id: &str) -> Option<SocketAddr> {
        self.sessions.get_by_peer_id(peer_id).map(|s| s.peer_addr)
    }

    /// Drives the event loop until the command channel is closed.
    pub async fn run(mut self) -> TransportResult<()> {
        let mut ticker = tokio::time::interval(self.config.tick_period);
        loop {
            tokio::select! {
                recv = self.endpoint.recv_from() => {
                    match recv {
                        Ok((bytes, from)) => self.on_raw_datagram(&bytes, from).await,
                        Err(e) => warn!(error = %e, "socket read failed"),
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => {
                            info!("command channel closed, stopping transport loop");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenSend {
                peer_addr,
                total_size,
                producer,
                reply,
            } => {
                let stream_id = self.next_stream_id;
                self.next_stream_id += 1;
                let now = Instant::now();
                let is_connected = {
                    let session = self.sessions.get_or_create(peer_addr, now);
                    session.start(now);
                    session.is_connected()
                };
                if is_connected {
                    let send_limit = self.balancer.send_budget().bytes_per_sec;
                    let stream =
                        SendStream::new(stream_id, total_size, producer, now, send_limit, None);
                    self.send_streams
                        .insert(stream_id, SendEntry { peer_addr, stream });
                    self.rebalance();
                } else {
                    // Queued until the session reaches CONNECTED; drained
                    // from `on_raw_datagram` on `newly_connected`.
                    self.sessions
                        .get_mut(&peer_addr)
                        .expect("just created above")
                        .queue_pending_outbound(stream_id, now);
                    self.pending_sends.insert(
                        stream_id,
                        PendingSend {
                            peer_addr,
                            total_size,
                            producer,
                        },
                    );
                }
                let _ = reply.send(stream_id);
            }
            Command::SendData {
                stream_id,
                data,
                reply,
            } => {
                let result = match self.send_streams.get_mut(&stream_id) {
                    Some(entry) => entry.stream.consume(&data),
                    None => Err(TransportError::MalformedDatagram(format!(
                        "unknown send stream {stream_id}"
                    ))),
                };
                let _ = reply.send(result);
            }
            Command::CloseStream { stream_id } => {
                if let Some(mut entry) = self.send_streams.remove(&stream_id) {
                    entry.stream.close();
                }
                if let Some(mut entry) = self.recv_streams.remove(&stream_id) {
                    entry.stream.close();
                }
                if let Some(mut pending) = self.pending_sends.remove(&stream_id) {
                    pending
                        .producer
                        .on_send_complete(crate::stream::Outcome::failed("stream closed", false));
                }
                self.rebalance();
            }
        }
    }

    #[instrument(skip(self, bytes), fields(from = %from, len = bytes.len()))]
    async fn on_raw_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let datagram = match Datagram::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "dropping malformed datagram");
                return;
            }
        };
        let now = Instant::now();

        // Only PING/GREETING may open a session from an address we have
        // not seen before; everything else from an unknown address is
        // dropped silently (SPEC_FULL.md §3).
        let is_handshake_opener = matches!(datagram, Datagram::Ping | Datagram::Greeting { .. });
        if !is_handshake_opener && self.sessions.get_mut(&from).is_none() {
            debug!(%from, "dropping datagram from unknown session");
            return;
        }

        let session_event = {
            let session = self.sessions.get_or_create(from, now);
            session.note_datagram_received(now, bytes.len());
            session.on_datagram(&datagram, &self.local_id, &self.local_url, now)
        };
        if session_event.peer_identity_conflict {
            if let Some((peer_id, peer_url)) = self
                .sessions
                .get_mut(&from)
                .and_then(|s| Some((s.peer_id.clone()?, s.peer_url.clone()?)))
            {
                self.sessions.close_conflicting(&peer_id, &peer_url, &from);
            }
        }
        if let Some(reply) = session_event.reply {
            self.send_datagram(reply, from).await;
        }
        if session_event.newly_connected {
            let ids = self
                .sessions
                .get_mut(&from)
                .map(|s| s.drain_pending_outbound())
                .unwrap_or_default();
            self.drain_pending_sends(ids);
        }

        match datagram {
            Datagram::Data(d) => {
                let stream_id = d.stream_id;
                if !self.recv_streams.contains_key(&stream_id) {
                    let consumer = (self.consumer_factory)(stream_id, d.total_size, from);
                    let limit = self.balancer.recv_budget().bytes_per_sec;
                    let stream = RecvStream::new(stream_id, d.total_size, consumer, now, limit);
                    self.recv_streams.insert(
                        stream_id,
                        RecvEntry {
                            peer_addr: from,
                            stream,
                        },
                    );
                    self.rebalance();
                }
                if let Some(entry) = self.recv_streams.get_mut(&stream_id) {
                    entry.stream.on_data(&d, now);
                    let tick = entry.stream.maybe_ack(now);
                    if let Some(ack) = tick.ack {
                        let datagram = Datagram::Ack(AckDatagram {
                            stream_id,
                            eof: ack.eof,
                            acked_block_ids: ack.acked_block_ids,
                            pause: ack.pause,
                        });
                        self.send_datagram(datagram, from).await;
                    }
                    if tick.timeout {
                        entry.stream.timeout();
                        self.recv_streams.remove(&stream_id);
                        self.rebalance();
                    }
                }
            }
            Datagram::Ack(a) => {
                if let Some(entry) = self.send_streams.get_mut(&a.stream_id) {
                    let pause = a
                        .pause
                        .map(|p| (p.pause_seconds, p.receive_limit_bytes_per_sec));
                    let result = entry.stream.on_ack(&a.acked_block_ids, a.eof, pause, now);
                    if let Some((pause_seconds, _)) = result.pause {
                        debug!(stream_id = a.stream_id, pause_seconds, "remote requested pause");
                    }
                    if result.outcome.is_some() {
                        self.send_streams.remove(&a.stream_id);
                        self.rebalance();
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        let mut timed_out_addrs: Vec<SocketAddr> = Vec::new();
        for (addr, session) in self.sessions.iter_mut() {
            let tick = session.tick(now, &self.local_id, &self.local_url);
            for datagram in tick.datagrams {
                self.endpoint.send_to(&datagram, *addr).await.ok();
            }
            if tick.timed_out {
                timed_out_addrs.push(*addr);
            }
        }
        self.sessions.retain_open();
        for addr in timed_out_addrs {
            self.close_streams_for_peer(addr);
        }

        // SPEC_FULL.md §4.7 step 2: accumulate each SENDING stream's
        // measured outgoing rate and average them for this tick's 3x
        // bandwidth ceiling (§4.4.2 step 1), rather than the static
        // per-stream budget.
        let rates: Vec<f64> = self
            .send_streams
            .values()
            .filter(|e| e.stream.state() == StreamState::Sending)
            .map(|e| e.stream.current_send_rate(now))
            .collect();
        self.balancer.record_send_rates(rates.into_iter());
        let avg_send_rate = self.balancer.average_send_rate();
        let mut finished_sends = Vec::new();
        let mut timed_out_sends = Vec::new();
        for (&stream_id, entry) in self.send_streams.iter_mut() {
            let tick = entry.stream.tick(now, avg_send_rate);
            for d in tick.datagrams {
                self.endpoint
                    .send_to(&Datagram::Data(d), entry.peer_addr)
                    .await
                    .ok();
            }
            if tick.timeout {
                timed_out_sends.push(stream_id);
            }
            if entry.stream.state() == StreamState::Completion {
                finished_sends.push(stream_id);
            }
        }
        for stream_id in timed_out_sends {
            if let Some(entry) = self.send_streams.get_mut(&stream_id) {
                entry.stream.timeout();
            }
            self.send_streams.remove(&stream_id);
        }
        for stream_id in finished_sends {
            self.send_streams.remove(&stream_id);
        }

        let mut finished_recvs = Vec::new();
        let mut timed_out_recvs = Vec::new();
        for (&stream_id, entry) in self.recv_streams.iter_mut() {
            let tick = entry.stream.maybe_ack(now);
            if let Some(ack) = tick.ack {
                let datagram = Datagram::Ack(AckDatagram {
                    stream_id,
                    eof: ack.eof,
                    acked_block_ids: ack.acked_block_ids,
                    pause: ack.pause,
                });
                self.endpoint.send_to(&datagram, entry.peer_addr).await.ok();
            }
            if tick.timeout {
                timed_out_recvs.push(stream_id);
            }
            if entry.stream.state() == StreamState::Completion {
                finished_recvs.push(stream_id);
            }
        }
        for stream_id in timed_out_recvs {
            if let Some(entry) = self.recv_streams.get_mut(&stream_id) {
                entry.stream.timeout();
            }
            self.recv_streams.remove(&stream_id);
        }
        for stream_id in finished_recvs {
            self.recv_streams.remove(&stream_id);
        }

        if !finished_sends.is_empty() || !finished_recvs.is_empty() {
            self.rebalance();
        }
    }

    fn close_streams_for_peer(&mut self, addr: SocketAddr) {
        let send_ids: Vec<u32> = self
            .send_streams
            .iter()
            .filter(|(_, e)| e.peer_addr == addr)
            .map(|(id, _)| *id)
            .collect();
        for id in send_ids {
            if let Some(mut entry) = self.send_streams.remove(&id) {
                entry.stream.close();
            }
        }
        let recv_ids: Vec<u32> = self
            .recv_streams
            .iter()
            .filter(|(_, e)| e.peer_addr == addr)
            .map(|(id, _)| *id)
            .collect();
        for id in recv_ids {
            if let Some(mut entry) = self.recv_streams.remove(&id) {
                entry.stream.close();
            }
        }
        let pending_ids: Vec<u32> = self
            .pending_sends
            .iter()
            .filter(|(_, p)| p.peer_addr == addr)
            .map(|(id, _)| *id)
            .collect();
        for id in pending_ids {
            if let Some(mut pending) = self.pending_sends.remove(&id) {
                pending
                    .producer
                    .on_send_complete(crate::stream::Outcome::failed(
                        "session closed before connecting",
                        false,
                    ));
            }
        }
        self.rebalance();
    }

    /// Creates and registers a `SendStream` for each ticket queued while
    /// its session was still handshaking (SPEC_FULL.md §4.3: "on entering
    /// CONNECTED, the session drains its queued outbound file tickets").
    fn drain_pending_sends(&mut self, stream_ids: Vec<u32>) {
        if stream_ids.is_empty() {
            return;
        }
        let now = Instant::now();
        let send_limit = self.balancer.send_budget().bytes_per_sec;
        for stream_id in stream_ids {
            if let Some(pending) = self.pending_sends.remove(&stream_id) {
                let stream = SendStream::new(
                    stream_id,
                    pending.total_size,
                    pending.producer,
                    now,
                    send_limit,
                    None,
                );
                self.send_streams.insert(
                    stream_id,
                    SendEntry {
                        peer_addr: pending.peer_addr,
                        stream,
                    },
                );
            }
        }
        self.rebalance();
    }

    /// Recomputes every stream's budget after the active set changes
    /// (SPEC_FULL.md §4.6): the balancer resets each stream's pacing
    /// factor to its initial value as part of this.
    fn rebalance(&mut self) {
        self.balancer.note_send_stream_count(self.send_streams.len());
        self.balancer.note_recv_stream_count(self.recv_streams.len());
        let send_budget = self.balancer.send_budget().bytes_per_sec;
        let recv_budget = self.balancer.recv_budget().bytes_per_sec;
        for entry in self.send_streams.values_mut() {
            entry.stream.set_send_limit(send_budget);
        }
        for entry in self.recv_streams.values_mut() {
            entry.stream.set_receive_limit(recv_budget);
        }
    }

    async fn send_datagram(&mut self, datagram: Datagram, to: SocketAddr) {
        if let Err(e) = self.endpoint.send_to(&datagram, to).await {
            warn!(error = %e, %to, "failed to send datagram");
        } else if let Some(session) = self.sessions.get_mut(&to) {
            session.note_datagram_sent(datagram.encode().len());
        }
    }
}
