//! Per-peer handshake session (SPEC_FULL.md §4.3), grounded in the
//! original `UDPSession` automaton: AT_STARTUP -> PING -> GREETING ->
//! CONNECTED, with CLOSED reachable from any state.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::{
    GREETING_TIMEOUT, PING_TIMEOUT, SESSION_ALIVE_PERIOD, SESSION_GREETING_PERIOD,
    SESSION_IDLE_TIMEOUT, SESSION_PING_PERIOD,
};
use crate::wire::Datagram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AtStartup,
    Ping,
    Greeting,
    Connected,
    Closed,
}

/// A file (or other payload) waiting on a peer identity to resolve
/// before its stream can open, mirroring `_PendingOutboxFiles` in the
/// original -- but scoped to one session instead of a module global.
pub struct PendingOutbound {
    pub stream_id: u32,
    pub queued_at: Instant,
}

pub struct Session {
    pub peer_addr: SocketAddr,
    pub peer_id: Option<String>,
    pub peer_url: Option<String>,
    state: SessionState,
    created_at: Instant,
    last_datagram_received: Instant,
    last_ping_sent: Option<Instant>,
    last_greeting_sent: Option<Instant>,
    last_alive_sent: Option<Instant>,
    bytes_sent: u64,
    bytes_received: u64,
    pending_outbound: VecDeque<PendingOutbound>,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, now: Instant) -> Self {
        Self {
            peer_addr,
            peer_id: None,
            peer_url: None,
            state: SessionState::AtStartup,
            created_at: now,
            last_datagram_received: now,
            last_ping_sent: None,
            last_greeting_sent: None,
            last_alive_sent: None,
            bytes_sent: 0,
            bytes_received: 0,
            pending_outbound: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn queue_pending_outbound(&mut self, stream_id: u32, now: Instant) {
        self.pending_outbound.push_back(PendingOutbound {
            stream_id,
            queued_at: now,
        });
    }

    /// Drains streams queued before the peer identity was known, once
    /// the session reaches CONNECTED. Mirrors `doCheckPendingFiles`.
    pub fn drain_pending_outbound(&mut self) -> Vec<u32> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.pending_outbound
            .drain(..)
            .map(|p| p.stream_id)
            .collect()
    }

    pub fn note_datagram_received(&mut self, now: Instant, bytes: usize) {
        self.last_datagram_received = now;
        self.bytes_received += bytes as u64;
    }

    pub fn note_datagram_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Handshake kickoff: move AT_STARTUP -> PING and produce the first
    /// PING datagram to send.
    pub fn start(&mut self, now: Instant) -> Option<Datagram> {
        if self.state != SessionState::AtStartup {
            return None;
        }
        self.state = SessionState::Ping;
        self.last_ping_sent = Some(now);
        Some(Datagram::Ping)
    }

    /// §4.3: handle one inbound datagram addressed to this session.
    /// Returns an outbound reply datagram when the handshake requires
    /// one, and a GREETING conflict signal the caller uses to shut down
    /// any other session sharing the learned peer id/url.
    pub fn on_datagram(
        &mut self,
        datagram: &Datagram,
        local_id: &str,
        local_url: &str,
        now: Instant,
    ) -> SessionEvent {
        self.last_datagram_received = now;
        match datagram {
            Datagram::Ping => {
                if self.state == SessionState::AtStartup || self.state == SessionState::Ping {
                    self.state = SessionState::Greeting;
                    self.last_greeting_sent = Some(now);
                    return SessionEvent::reply(Datagram::Greeting {
                        peer_id: local_id.to_string(),
                        peer_url: local_url.to_string(),
                    });
                }
                SessionEvent::none()
            }
            Datagram::Greeting { peer_id, peer_url } => {
                let conflict = self
                    .peer_id
                    .as_deref()
                    .is_some_and(|existing| existing != peer_id)
                    || self
                        .peer_url
                        .as_deref()
                        .is_some_and(|existing| existing != peer_url);
                self.peer_id = Some(peer_id.clone());
                self.peer_url = Some(peer_url.clone());
                let was_connected = self.state == SessionState::Connected;
                self.state = SessionState::Connected;
                // Always reply with ALIVE, never echo GREETING back.
                let mut event = SessionEvent::reply(Datagram::Alive);
                event.peer_identity_conflict = conflict;
                event.newly_connected = !was_connected;
                event
            }
            Datagram::Alive => {
                let was_connected = self.state == SessionState::Connected;
                if matches!(self.state, SessionState::Ping | SessionState::Greeting) {
                    self.state = SessionState::Connected;
                }
                if self.state == SessionState::Connected {
                    self.last_alive_sent = Some(now);
                }
                let mut event = SessionEvent::none();
                event.newly_connected = !was_connected && self.state == SessionState::Connected;
                event
            }
            Datagram::Data(_) | Datagram::Ack(_) => {
                if self.state == SessionState::AtStartup {
                    self.state = SessionState::Connected;
                }
                SessionEvent::none()
            }
        }
    }

    /// §4.3 timers: `timer-1sec` drives PING/GREETING retries,
    /// `timer-10sec` drives CONNECTED keepalive, `timer-30sec`/`timer-1min`
    /// drive the handshake and idle timeouts.
    pub fn tick(&mut self, now: Instant, local_id: &str, local_url: &str) -> SessionTick {
        let mut out = SessionTick::default();
        match self.state {
            SessionState::AtStartup => {}
            SessionState::Ping => {
                if now.duration_since(self.created_at) > PING_TIMEOUT {
                    self.state = SessionState::Closed;
                    out.timed_out = true;
                    return out;
                }
                if self
                    .last_ping_sent
                    .map_or(true, |t| now.duration_since(t) > SESSION_PING_PERIOD)
                {
                    self.last_ping_sent = Some(now);
                    out.datagrams.push(Datagram::Ping);
                }
            }
            SessionState::Greeting => {
                if now.duration_since(self.created_at) > GREETING_TIMEOUT {
                    self.state = SessionState::Closed;
                    out.timed_out = true;
                    return out;
                }
                if self
                    .last_greeting_sent
                    .map_or(true, |t| now.duration_since(t) > SESSION_GREETING_PERIOD)
                {
                    self.last_greeting_sent = Some(now);
                    out.datagrams.push(Datagram::Greeting {
                        peer_id: local_id.to_string(),
                        peer_url: local_url.to_string(),
                    });
                }
            }
            SessionState::Connected => {
                if now.duration_since(self.last_datagram_received) > SESSION_IDLE_TIMEOUT {
                    self.state = SessionState::Closed;
                    out.timed_out = true;
                    return out;
                }
                if self
                    .last_alive_sent
                    .map_or(true, |t| now.duration_since(t) > SESSION_ALIVE_PERIOD)
                {
                    self.last_alive_sent = Some(now);
                    out.datagrams.push(Datagram::Alive);
                }
            }
            SessionState::Closed => {}
        }
        out
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[derive(Debug, Default)]
pub struct SessionEvent {
    pub reply: Option<Datagram>,
    pub peer_identity_conflict: bool,
    pub newly_connected: bool,
}

impl SessionEvent {
    fn none() -> Self {
        Self::default()
    }

    fn reply(datagram: Datagram) -> Self {
        Self {
            reply: Some(datagram),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTick {
    pub datagrams: Vec<Datagram>,
    pub timed_out: bool,
}

/// Keyed by peer address; resolves to at most one CONNECTED session per
/// peer id by closing older sessions on conflict (mirrors the original's
/// `CloseAllByIdURL` sweep in `doReceiveData`/GREETING handling).
#[derive(Default)]
pub struct SessionTable {
    by_addr: HashMap<SocketAddr, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, addr: SocketAddr, now: Instant) -> &mut Session {
        self.by_addr.entry(addr).or_insert_with(|| Session::new(addr, now))
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        self.by_addr.get_mut(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Session> {
        self.by_addr.remove(addr)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut Session)> {
        self.by_addr.iter_mut()
    }

    /// Mirrors the original's `get_by_peer_id` registry lookup.
    pub fn get_by_peer_id(&self, peer_id: &str) -> Option<&Session> {
        self.by_addr
            .values()
            .find(|s| s.peer_id.as_deref() == Some(peer_id))
    }

    /// Closes every other session that has learned the same peer id or
    /// the same peer url, keeping `keep_addr`'s session as the live one.
    /// A session cannot share either identifier with more than one peer.
    pub fn close_conflicting(&mut self, peer_id: &str, peer_url: &str, keep_addr: &SocketAddr) {
        for (addr, session) in self.by_addr.iter_mut() {
            if addr != keep_addr
                && (session.peer_id.as_deref() == Some(peer_id)
                    || session.peer_url.as_deref() == Some(peer_url))
            {
                session.close();
            }
        }
    }

    pub fn retain_open(&mut self) {
        self.by_addr.retain(|_, s| s.state() != SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_reaches_connected_on_greeting_exchange() {
        let t0 = Instant::now();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut s = Session::new(addr, t0);
        assert_eq!(s.start(t0), Some(Datagram::Ping));
        assert_eq!(s.state(), SessionState::Ping);

        let event = s.on_datagram(
            &Datagram::Greeting {
                peer_id: "bob".into(),
                peer_url: "http://bob/".into(),
            },
            "alice",
            "http://alice/",
            t0 + Duration::from_millis(10),
        );
        assert!(event.reply.is_some());
        assert!(event.newly_connected);
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn conflicting_greeting_is_flagged() {
        let t0 = Instant::now();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut s = Session::new(addr, t0);
        s.on_datagram(
            &Datagram::Greeting {
                peer_id: "bob".into(),
                peer_url: "http://bob/".into(),
            },
            "alice",
            "http://alice/",
            t0,
        );
        let event = s.on_datagram(
            &Datagram::Greeting {
                peer_id: "mallory".into(),
                peer_url: "http://mallory/".into(),
            },
            "alice",
            "http://alice/",
            t0 + Duration::from_secs(1),
        );
        assert!(event.peer_identity_conflict);
    }

    #[test]
    fn alive_completes_handshake_from_ping_state() {
        let t0 = Instant::now();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut s = Session::new(addr, t0);
        s.start(t0);
        assert_eq!(s.state(), SessionState::Ping);

        let event = s.on_datagram(&Datagram::Alive, "alice", "http://alice/", t0 + Duration::from_millis(5));
        assert!(event.newly_connected);
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn conflicting_peer_url_with_matching_peer_id_is_flagged() {
        let t0 = Instant::now();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut s = Session::new(addr, t0);
        s.on_datagram(
            &Datagram::Greeting {
                peer_id: "bob".into(),
                peer_url: "http://bob/".into(),
            },
            "alice",
            "http://alice/",
            t0,
        );
        let event = s.on_datagram(
            &Datagram::Greeting {
                peer_id: "bob".into(),
                peer_url: "http://bob-impostor/".into(),
            },
            "alice",
            "http://alice/",
            t0 + Duration::from_secs(1),
        );
        assert!(event.peer_identity_conflict);
    }

    #[test]
    fn ping_times_out_after_limit() {
        let t0 = Instant::now();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut s = Session::new(addr, t0);
        s.start(t0);
        let tick = s.tick(t0 + PING_TIMEOUT + Duration::from_secs(1), "alice", "http://alice/");
        assert!(tick.timed_out);
        assert_eq!(s.state(), SessionState::Closed);
    }
}
