//! Reliable sender half of a stream (SPEC_FULL.md §4.4).

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::config::{
    ACK_TIMEOUT_LIMIT, BLOCKS_PER_ACK, MAX_OUTSTANDING_BLOCKS, MAX_RTT_SAMPLES,
    OUTPUT_BUFFER_SIZE, RTT_MAX, RTT_MIN, SENDING_LIMIT_FACTOR_ON_START,
};
use crate::error::{TransportError, TransportResult};
use crate::stream::{Outcome, Producer, StreamState};
use crate::wire::DataDatagram;

struct OutputBlock {
    data: Vec<u8>,
    time_sent: Option<Duration>,
    acks_missed: u32,
}

/// Diagnostic counters mirroring the original implementation's
/// `output_*` instrumentation, surfaced for observability/logging only.
#[derive(Debug, Clone, Default)]
pub struct SendStats {
    pub blocks_sent: u64,
    pub blocks_acked: u64,
    pub retries: u32,
    pub timed_out_blocks: u32,
    pub garbage_acks: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
}

#[derive(Debug, Default)]
pub struct TickResult {
    pub datagrams: Vec<DataDatagram>,
    pub timeout: bool,
}

#[derive(Debug, Default)]
pub struct AckApplyResult {
    /// `Some(pause_seconds, receiver's receive-rate limit)` when the ACK
    /// carried a PAUSE directive and this stream just entered PAUSE.
    pub pause: Option<(f32, f32)>,
    /// Set once, the tick this stream reaches COMPLETION.
    pub outcome: Option<Outcome>,
}

pub struct SendStream {
    stream_id: u32,
    total_size: u32,
    created_at: Instant,
    producer: Box<dyn Producer>,

    state: StreamState,
    eof: bool,
    notified: bool,

    next_block_id: i32,
    acked_cursor: i32,
    acked_above_cursor: BTreeSet<i32>,
    output_blocks: BTreeMap<i32, OutputBlock>,
    output_buffer_size: usize,

    bytes_sent_total: u64,
    bytes_acked_total: u64,
    blocks_sent_counter: u64,
    acks_received_counter: u64,
    garbage_ack_counter: u64,
    retries_counter: u32,
    timed_out_counter: u32,
    success_counter: u64,
    ack_timeouts_counter: u32,

    last_block_sent: Duration,
    last_ack_received: Duration,
    pause_until: Option<Instant>,

    rtt_avg: f64,
    rtt_count: f64,

    send_limit_bytes_per_sec: f64,
    factor: f64,
    remote_limit_bytes_per_sec: Option<f64>,
}

impl SendStream {
    pub fn new(
        stream_id: u32,
        total_size: u32,
        producer: Box<dyn Producer>,
        created_at: Instant,
        send_limit_bytes_per_sec: f64,
        initial_rtt_estimate: Option<Duration>,
    ) -> Self {
        let rtt0 = initial_rtt_estimate
            .unwrap_or((RTT_MIN + RTT_MAX) / 2)
            .as_secs_f64();
        Self {
            stream_id,
            total_size,
            created_at,
            producer,
            state: StreamState::Downtime,
            eof: false,
            notified: false,
            next_block_id: 1,
            acked_cursor: 0,
            acked_above_cursor: BTreeSet::new(),
            output_blocks: BTreeMap::new(),
            output_buffer_size: 0,
            bytes_sent_total: 0,
            bytes_acked_total: 0,
            blocks_sent_counter: 0,
            acks_received_counter: 0,
            garbage_ack_counter: 0,
            retries_counter: 0,
            timed_out_counter: 0,
            success_counter: 0,
            ack_timeouts_counter: 0,
            last_block_sent: Duration::ZERO,
            last_ack_received: Duration::ZERO,
            pause_until: None,
            rtt_avg: rtt0,
            rtt_count: 1.0,
            send_limit_bytes_per_sec,
            factor: SENDING_LIMIT_FACTOR_ON_START,
            remote_limit_bytes_per_sec: None,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> SendStats {
        SendStats {
            blocks_sent: self.blocks_sent_counter,
            blocks_acked: self.success_counter,
            retries: self.retries_counter,
            timed_out_blocks: self.timed_out_counter,
            garbage_acks: self.garbage_ack_counter,
            bytes_sent: self.bytes_sent_total,
            bytes_acked: self.bytes_acked_total,
        }
    }

    /// Applies the balancer's per-stream budget; resets the pacing
    /// factor to its initial value as SPEC_FULL.md §4.6 requires.
    pub fn set_send_limit(&mut self, bytes_per_sec: f64) {
        self.send_limit_bytes_per_sec = bytes_per_sec;
        self.factor = SENDING_LIMIT_FACTOR_ON_START;
    }

    /// This stream's measured outgoing byte rate so far, fed into the
    /// balancer's cross-stream average (SPEC_FULL.md §4.7 step 2).
    pub fn current_send_rate(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.created_at).as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_sent_total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// §4.4.1: split `data` into BLOCK_SIZE chunks and enqueue them.
    /// Rejects with `BufferOverflow` without mutating state if either
    /// backpressure ceiling would be exceeded.
    pub fn consume(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.output_buffer_size + data.len() > OUTPUT_BUFFER_SIZE {
            return Err(TransportError::BufferOverflow {
                current: self.output_buffer_size,
                limit: OUTPUT_BUFFER_SIZE,
            });
        }
        let outstanding = (self.next_block_id - 1 - self.acked_cursor).max(0) as usize;
        if outstanding > MAX_OUTSTANDING_BLOCKS {
            return Err(TransportError::BufferOverflow {
                current: outstanding,
                limit: MAX_OUTSTANDING_BLOCKS,
            });
        }
        for chunk in data.chunks(crate::config::BLOCK_SIZE) {
            let block_id = self.next_block_id;
            self.next_block_id += 1;
            self.output_buffer_size += chunk.len();
            self.output_blocks.insert(
                block_id,
                OutputBlock {
                    data: chunk.to_vec(),
                    time_sent: None,
                    acks_missed: 0,
                },
            );
        }
        if self.state == StreamState::Downtime {
            self.state = StreamState::Sending;
        }
        Ok(())
    }

    /// §4.4.2: one scheduler tick. `global_avg_send_rate` is the
    /// balancer's cross-stream average used for the `3x` ceiling.
    pub fn tick(&mut self, now: Instant, global_avg_send_rate: f64) -> TickResult {
        let mut out = TickResult::default();
        if self.output_blocks.is_empty() {
            return out;
        }
        if self.state == StreamState::Pause {
            match self.pause_until {
                Some(until) if now < until => return out,
                _ => self.resume(),
            }
        }
        let elapsed = now.duration_since(self.created_at);
        let rel = elapsed.as_secs_f64();

        // 1. bandwidth gate
        let mut effective_limit = self.send_limit_bytes_per_sec * self.factor;
        if global_avg_send_rate > 0.0 {
            effective_limit = effective_limit.min(global_avg_send_rate * 3.0);
        }
        if let Some(remote) = self.remote_limit_bytes_per_sec {
            if remote >= 0.0 {
                effective_limit = effective_limit.min(remote);
            }
        }
        if effective_limit > 0.0 && rel > 0.5 {
            let current_rate = self.bytes_sent_total as f64 / rel;
            if current_rate > effective_limit {
                return out;
            }
        }

        // 2. response stall detection
        if self.acks_received_counter > 0 {
            let ratio = self.blocks_sent_counter as f64 / self.acks_received_counter as f64;
            if ratio > (BLOCKS_PER_ACK * 2) as f64 {
                let since_last_ack = elapsed.saturating_sub(self.last_ack_received);
                if since_last_ack > RTT_MAX * 3 {
                    out.timeout = true;
                }
                return out;
            }
        }

        // 3. broken-link detection
        if self
            .last_block_sent
            .saturating_sub(self.last_ack_received)
            > RTT_MAX * 2
        {
            self.ack_timeouts_counter += 1;
            if self.ack_timeouts_counter >= ACK_TIMEOUT_LIMIT {
                out.timeout = true;
                return out;
            }
            if let Some((&oldest, _)) = self.output_blocks.iter().next() {
                self.retries_counter += 1;
                self.send_block(oldest, elapsed, &mut out.datagrams);
            }
            return out;
        }

        // 4. normal sending
        let rtt_current = self.rtt_avg / self.rtt_count;
        let resend_threshold =
            (BLOCKS_PER_ACK as f64 * rtt_current * 2.0).min(RTT_MAX.as_secs_f64());

        let mut chosen: Vec<i32> = Vec::new();
        for (&bid, block) in self.output_blocks.iter() {
            if chosen.len() >= BLOCKS_PER_ACK {
                break;
            }
            if block.time_sent.is_none() {
                chosen.push(bid);
            }
        }
        if chosen.is_empty() {
            for (&bid, block) in self.output_blocks.iter() {
                if chosen.len() >= BLOCKS_PER_ACK {
                    break;
                }
                if let Some(sent) = block.time_sent {
                    if rel - sent.as_secs_f64() > resend_threshold {
                        chosen.push(bid);
                    }
                }
            }
            if !chosen.is_empty() {
                self.retries_counter += chosen.len() as u32;
                self.timed_out_counter += chosen.len() as u32;
            }
        }
        for bid in chosen {
            self.send_block(bid, elapsed, &mut out.datagrams);
        }
        out
    }

    fn send_block(&mut self, block_id: i32, elapsed: Duration, datagrams: &mut Vec<DataDatagram>) {
        let block = self
            .output_blocks
            .get_mut(&block_id)
            .expect("send_block called with a known block id");
        block.time_sent = Some(elapsed);
        block.acks_missed = 0;
        let payload = block.data.clone();
        self.bytes_sent_total += payload.len() as u64;
        self.blocks_sent_counter += 1;
        self.last_block_sent = elapsed;
        datagrams.push(DataDatagram {
            stream_id: self.stream_id,
            total_size: self.total_size,
            block_id,
            payload,
        });
    }

    /// §4.4.3: apply an incoming ACK body.
    pub fn on_ack(
        &mut self,
        acked_block_ids: &[i32],
        eof_flag: bool,
        pause: Option<(f32, f32)>,
        now: Instant,
    ) -> AckApplyResult {
        let elapsed = now.duration_since(self.created_at);
        self.last_ack_received = elapsed;
        self.acks_received_counter += 1;

        for &block_id in acked_block_ids {
            let Some(block) = self.output_blocks.remove(&block_id) else {
                self.garbage_ack_counter += 1;
                continue;
            };
            let block_size = block.data.len();
            self.bytes_acked_total += block_size as u64;
            self.output_buffer_size = self.output_buffer_size.saturating_sub(block_size);
            self.success_counter += 1;

            if let Some(sent) = block.time_sent {
                let sample = elapsed.saturating_sub(sent).as_secs_f64();
                self.rtt_avg += sample;
                self.rtt_count += 1.0;
                if self.rtt_count > MAX_RTT_SAMPLES {
                    let dropped_avg = self.rtt_avg / self.rtt_count;
                    self.rtt_count = (MAX_RTT_SAMPLES / 2.0).round();
                    self.rtt_avg = dropped_avg * self.rtt_count;
                }
            }

            if self.producer.on_sent_raw_data(block_size) {
                self.eof = true;
            }
            if block_id > self.acked_cursor {
                self.acked_above_cursor.insert(block_id);
            }
        }

        for (&bid, block) in self.output_blocks.iter_mut() {
            if !acked_block_ids.contains(&bid) {
                block.acks_missed += 1;
            }
        }

        loop {
            let next = self.acked_cursor + 1;
            if self.acked_above_cursor.remove(&next) {
                self.acked_cursor = next;
            } else {
                break;
            }
        }

        if eof_flag {
            self.eof = true;
        }

        let mut result = AckApplyResult::default();
        if let Some((pause_seconds, remote_limit)) = pause {
            if pause_seconds > 0.0 {
                self.state = StreamState::Pause;
                self.pause_until = Some(now + Duration::from_secs_f32(pause_seconds.max(0.0)));
                if remote_limit > 0.0 {
                    self.remote_limit_bytes_per_sec = Some(remote_limit as f64);
                }
                result.pause = Some((pause_seconds, remote_limit));
            }
        }

        if self.eof && !self.notified {
            self.state = StreamState::Completion;
            self.notified = true;
            let outcome = if self.producer.is_done() {
                Outcome::finished()
            } else {
                Outcome::failed("sending was not finished correctly", false)
            };
            self.producer.on_send_complete(outcome.clone());
            result.outcome = Some(outcome);
        }
        result
    }

    /// Leaves PAUSE early (explicit resume) or is called by `tick` once
    /// `pause_until` has elapsed (SPEC_FULL.md §4.4.3 step 6).
    pub fn resume(&mut self) {
        if self.state == StreamState::Pause {
            self.state = StreamState::Sending;
        }
        self.pause_until = None;
    }

    /// Stream-level timeout (stall or broken-link paths from `tick`).
    pub fn timeout(&mut self) -> Outcome {
        self.state = StreamState::Completion;
        let message = if self.acks_received_counter == 0 {
            "sending failed"
        } else {
            "remote side stopped responding"
        };
        let outcome = Outcome::failed(message, true);
        if !self.notified {
            self.notified = true;
            self.producer.on_send_complete(outcome.clone());
        }
        outcome
    }

    /// Explicit cancellation (session/endpoint shutdown).
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        if !self.notified {
            self.notified = true;
            self.producer
                .on_send_complete(Outcome::failed("stream closed", false));
        }
        self.output_blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingProducer {
        acked: usize,
        done: bool,
        outcome: Option<Outcome>,
    }

    impl Producer for RecordingProducer {
        fn on_sent_raw_data(&mut self, bytes_acked: usize) -> bool {
            self.acked += bytes_acked;
            false
        }

        fn on_send_complete(&mut self, outcome: Outcome) {
            self.outcome = Some(outcome);
        }

        fn is_done(&self) -> bool {
            self.done
        }
    }

    fn new_stream(total_size: u32) -> (SendStream, Instant) {
        let t0 = Instant::now();
        let producer = RecordingProducer {
            acked: 0,
            done: true,
            outcome: None,
        };
        (
            SendStream::new(1, total_size, Box::new(producer), t0, 1_000_000.0, None),
            t0,
        )
    }

    #[test]
    fn consume_splits_into_blocks_and_backpressures() {
        let (mut s, _t0) = new_stream(10_000);
        s.consume(&vec![0u8; 10_000]).unwrap();
        assert_eq!(s.output_blocks.len(), 21); // ceil(10000/494)

        let err = s.consume(&vec![0u8; crate::config::OUTPUT_BUFFER_SIZE]);
        assert!(matches!(err, Err(TransportError::BufferOverflow { .. })));
    }

    #[test]
    fn single_byte_ack_completes_with_eof() {
        let (mut s, t0) = new_stream(1);
        s.consume(&[42]).unwrap();
        let tick = s.tick(t0, 0.0);
        assert_eq!(tick.datagrams.len(), 1);
        assert_eq!(tick.datagrams[0].block_id, 1);

        let result = s.on_ack(&[1], true, None, t0 + Duration::from_millis(10));
        assert!(result.outcome.is_some());
        assert_eq!(s.state(), StreamState::Completion);
    }

    #[test]
    fn garbage_ack_is_counted_not_applied() {
        let (mut s, t0) = new_stream(1);
        s.consume(&[1]).unwrap();
        s.tick(t0, 0.0);
        let before = s.stats().garbage_acks;
        s.on_ack(&[999], false, None, t0);
        assert_eq!(s.stats().garbage_acks, before + 1);
    }

    #[test]
    fn ack_idempotence_on_repeat() {
        let (mut s, t0) = new_stream(2000);
        s.consume(&vec![0u8; 2000]).unwrap();
        s.tick(t0, 0.0);
        let ids: Vec<i32> = (1..=4).collect();
        s.on_ack(&ids, false, None, t0 + Duration::from_millis(5));
        let cursor_after_first = s.acked_cursor;
        let garbage_before = s.stats().garbage_acks;
        s.on_ack(&ids, false, None, t0 + Duration::from_millis(6));
        assert_eq!(s.acked_cursor, cursor_after_first);
        assert_eq!(s.stats().garbage_acks, garbage_before + ids.len() as u64);
    }

    #[test]
    fn pause_directive_enters_pause_state() {
        let (mut s, t0) = new_stream(2000);
        s.consume(&vec![0u8; 2000]).unwrap();
        s.tick(t0, 0.0);
        let result = s.on_ack(&[1], false, Some((2.0, 5_000.0)), t0 + Duration::from_millis(1));
        assert!(result.pause.is_some());
        assert_eq!(s.state(), StreamState::Pause);
        s.resume();
        assert_eq!(s.state(), StreamState::Sending);
    }
}
