//! Reliable receiver half of a stream (SPEC_FULL.md §4.5).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::{BLOCKS_PER_ACK, RECEIVE_TIMEOUT, RTT_MAX};
use crate::stream::{Consumer, Outcome, StreamState};
use crate::wire::{DataDatagram, PauseDirective, EMPTY_BLOCK_ID};

/// Diagnostic counters mirroring the original implementation's
/// `input_*` instrumentation.
#[derive(Debug, Clone, Default)]
pub struct RecvStats {
    pub blocks_received: u64,
    pub duplicate_blocks: u64,
    pub old_blocks: u64,
    pub acks_sent: u64,
    pub bytes_received: u64,
}

pub struct AckTick {
    pub ack: Option<AckOut>,
    pub timeout: bool,
}

/// What `maybe_ack` wants sent; the caller (session/transport) stamps
/// this with the stream id and serializes it.
pub struct AckOut {
    pub eof: bool,
    pub acked_block_ids: Vec<i32>,
    pub pause: Option<PauseDirective>,
}

pub struct RecvStream {
    stream_id: u32,
    #[allow(dead_code)]
    total_size: u32,
    created_at: Instant,
    consumer: Box<dyn Consumer>,

    state: StreamState,
    eof: bool,
    notified: bool,

    input_blocks: BTreeMap<i32, Vec<u8>>,
    to_ack: Vec<i32>,
    next_to_deliver: i32,

    last_block_received: Duration,
    last_ack_sent: Duration,

    bytes_received: u64,
    blocks_received_counter: u64,
    duplicate_counter: u64,
    old_counter: u64,
    acks_sent_counter: u64,

    receive_limit_bytes_per_sec: f64,
}

impl RecvStream {
    pub fn new(
        stream_id: u32,
        total_size: u32,
        consumer: Box<dyn Consumer>,
        created_at: Instant,
        receive_limit_bytes_per_sec: f64,
    ) -> Self {
        Self {
            stream_id,
            total_size,
            created_at,
            consumer,
            state: StreamState::Downtime,
            eof: false,
            notified: false,
            input_blocks: BTreeMap::new(),
            to_ack: Vec::new(),
            next_to_deliver: 0,
            last_block_received: Duration::ZERO,
            last_ack_sent: Duration::ZERO,
            bytes_received: 0,
            blocks_received_counter: 0,
            duplicate_counter: 0,
            old_counter: 0,
            acks_sent_counter: 0,
            receive_limit_bytes_per_sec,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> RecvStats {
        RecvStats {
            blocks_received: self.blocks_received_counter,
            duplicate_blocks: self.duplicate_counter,
            old_blocks: self.old_counter,
            acks_sent: self.acks_sent_counter,
            bytes_received: self.bytes_received,
        }
    }

    pub fn set_receive_limit(&mut self, bytes_per_sec: f64) {
        self.receive_limit_bytes_per_sec = bytes_per_sec;
    }

    fn insort_ack(&mut self, block_id: i32) {
        let idx = self.to_ack.partition_point(|&x| x < block_id);
        self.to_ack.insert(idx, block_id);
    }

    /// §4.5.1: process one inbound DATA datagram.
    pub fn on_data(&mut self, d: &DataDatagram, now: Instant) {
        let elapsed = now.duration_since(self.created_at);
        self.last_block_received = elapsed;
        if self.state == StreamState::Downtime {
            self.state = StreamState::Receiving;
        }

        if d.block_id == EMPTY_BLOCK_ID {
            // Keepalive-only: refreshes liveness, never touches the
            // sequence space or EOF latch.
            return;
        }

        self.blocks_received_counter += 1;
        self.bytes_received += d.payload.len() as u64;

        if d.block_id <= self.next_to_deliver {
            self.old_counter += 1;
            self.insort_ack(d.block_id);
        } else if self.input_blocks.contains_key(&d.block_id) {
            self.duplicate_counter += 1;
            self.insort_ack(d.block_id);
        } else {
            self.input_blocks.insert(d.block_id, d.payload.clone());
            self.insort_ack(d.block_id);
        }

        let mut assembled = Vec::new();
        while let Some(bytes) = self.input_blocks.remove(&(self.next_to_deliver + 1)) {
            self.next_to_deliver += 1;
            assembled.extend(bytes);
        }
        if !assembled.is_empty() {
            if self.consumer.on_received_raw_data(assembled) {
                self.eof = true;
            }
        }

        if self.eof && !self.notified {
            self.state = StreamState::Completion;
            self.notified = true;
            self.consumer.on_receive_complete(Outcome::finished());
        }
    }

    fn build_ack(&mut self, now: Instant, pause_seconds: f32) -> Option<AckOut> {
        if self.to_ack.is_empty() && pause_seconds <= 0.0 && !self.eof {
            return None;
        }
        let acked_block_ids = std::mem::take(&mut self.to_ack);
        self.acks_sent_counter += 1;
        self.last_ack_sent = now.duration_since(self.created_at);
        let pause = if pause_seconds > 0.0 {
            Some(PauseDirective {
                pause_seconds,
                receive_limit_bytes_per_sec: self.receive_limit_bytes_per_sec as f32,
            })
        } else {
            None
        };
        Some(AckOut {
            eof: self.eof,
            acked_block_ids,
            pause,
        })
    }

    /// §4.5.2: ACK policy, evaluated after every DATA and on every tick.
    pub fn maybe_ack(&mut self, now: Instant) -> AckTick {
        let elapsed = now.duration_since(self.created_at);

        if self.acks_sent_counter == 0 {
            return AckTick {
                ack: self.build_ack(now, 0.0),
                timeout: false,
            };
        }
        if self.blocks_received_counter == 0 {
            return AckTick {
                ack: None,
                timeout: false,
            };
        }

        let mut pause_seconds = 0.0f32;
        if self.receive_limit_bytes_per_sec > 0.0 {
            let rel = elapsed.as_secs_f64();
            let max_available = self.receive_limit_bytes_per_sec * rel;
            let received = self.bytes_received as f64;
            if received > max_available {
                let excess = received - max_available;
                pause_seconds = (excess / self.receive_limit_bytes_per_sec).max(0.0) as f32;
            }
        }

        if elapsed.saturating_sub(self.last_block_received) > RECEIVE_TIMEOUT {
            return AckTick {
                ack: None,
                timeout: true,
            };
        }

        if self.to_ack.len() > BLOCKS_PER_ACK {
            return AckTick {
                ack: self.build_ack(now, pause_seconds),
                timeout: false,
            };
        }
        if self.eof {
            return AckTick {
                ack: self.build_ack(now, pause_seconds),
                timeout: false,
            };
        }
        if elapsed.saturating_sub(self.last_ack_sent) > RTT_MAX {
            return AckTick {
                ack: self.build_ack(now, pause_seconds),
                timeout: false,
            };
        }
        AckTick {
            ack: None,
            timeout: false,
        }
    }

    pub fn timeout(&mut self) -> Outcome {
        self.state = StreamState::Completion;
        let outcome = Outcome::failed("receiving timeout", true);
        if !self.notified {
            self.notified = true;
            self.consumer.on_receive_complete(outcome.clone());
        }
        outcome
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        if !self.notified {
            self.notified = true;
            self.consumer
                .on_receive_complete(Outcome::failed("stream closed", false));
        }
        self.input_blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingConsumer {
        received: Vec<u8>,
        eof_after: usize,
        outcome: Option<Outcome>,
    }

    impl Consumer for RecordingConsumer {
        fn on_received_raw_data(&mut self, data: Vec<u8>) -> bool {
            self.received.extend(data);
            self.received.len() >= self.eof_after
        }

        fn on_receive_complete(&mut self, outcome: Outcome) {
            self.outcome = Some(outcome);
        }
    }

    fn new_stream(eof_after: usize) -> (RecvStream, Instant) {
        let t0 = Instant::now();
        let consumer = RecordingConsumer {
            received: Vec::new(),
            eof_after,
            outcome: None,
        };
        (
            RecvStream::new(1, eof_after as u32, Box::new(consumer), t0, 0.0),
            t0,
        )
    }

    fn data(stream_id: u32, block_id: i32, payload: &[u8]) -> DataDatagram {
        DataDatagram {
            stream_id,
            total_size: payload.len() as u32,
            block_id,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn in_order_delivery_and_completion() {
        let (mut s, t0) = new_stream(6);
        s.on_data(&data(1, 1, b"foo"), t0);
        s.on_data(&data(1, 2, b"bar"), t0 + Duration::from_millis(1));
        assert_eq!(s.state(), StreamState::Completion);
        assert!(s.stats().blocks_received == 2);
    }

    #[test]
    fn out_of_order_blocks_are_buffered_then_delivered_in_order() {
        let (mut s, t0) = new_stream(9);
        s.on_data(&data(1, 2, b"bbb"), t0);
        assert_eq!(s.next_to_deliver, 0); // can't deliver yet, 1 missing
        s.on_data(&data(1, 3, b"ccc"), t0);
        s.on_data(&data(1, 1, b"aaa"), t0);
        assert_eq!(s.next_to_deliver, 3);
    }

    #[test]
    fn duplicate_block_is_counted_and_still_acked() {
        let (mut s, t0) = new_stream(9);
        s.on_data(&data(1, 2, b"bbb"), t0);
        s.on_data(&data(1, 2, b"bbb"), t0);
        assert_eq!(s.stats().duplicate_blocks, 1);
    }

    #[test]
    fn empty_block_is_keepalive_only() {
        let (mut s, t0) = new_stream(100);
        s.on_data(&data(1, EMPTY_BLOCK_ID, b""), t0);
        assert_eq!(s.state(), StreamState::Receiving);
        assert_eq!(s.stats().blocks_received, 0);
        assert!(!s.eof);
    }

    #[test]
    fn seed_ack_sent_on_first_tick_after_data() {
        let (mut s, t0) = new_stream(9);
        s.on_data(&data(1, 1, b"aaa"), t0);
        let tick = s.maybe_ack(t0);
        assert!(tick.ack.is_some());
        assert_eq!(tick.ack.unwrap().acked_block_ids, vec![1]);
    }

    #[test]
    fn window_triggers_ack_past_threshold() {
        let (mut s, t0) = new_stream(9999);
        for i in 1..=BLOCKS_PER_ACK as i32 + 2 {
            s.on_data(&data(1, i, b"x"), t0);
        }
        let seed = s.maybe_ack(t0);
        assert!(seed.ack.is_some());
        for i in (BLOCKS_PER_ACK as i32 + 3)..=(BLOCKS_PER_ACK as i32 + 3 + BLOCKS_PER_ACK as i32) {
            s.on_data(&data(1, i, b"x"), t0);
        }
        let next = s.maybe_ack(t0);
        assert!(next.ack.is_some());
    }
}
