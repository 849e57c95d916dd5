//! Per-stream reliable delivery: `send` carries bytes out, `recv`
//! reassembles them on the other side. Both share the state machine
//! shape from SPEC_FULL.md §3/§4 (AT_STARTUP -> DOWNTIME -> {SENDING |
//! RECEIVING} -> PAUSE? -> COMPLETION -> CLOSED) even though the two
//! directions drive different transitions of it.

pub mod recv;
pub mod send;

/// Shared stream lifecycle. `AtStartup` only exists transiently during
/// construction; streams are handed to callers already in `Downtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AtStartup,
    Downtime,
    Sending,
    Receiving,
    Pause,
    Completion,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Finished,
    Failed,
}

/// Final, one-shot notification delivered to a producer or consumer
/// when its stream leaves COMPLETION. Everything before this point
/// (retries, garbage acks, single dropped datagrams) is internal.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: Status,
    pub error_message: Option<String>,
    pub timeout: bool,
}

impl Outcome {
    pub fn finished() -> Self {
        Self {
            status: Status::Finished,
            error_message: None,
            timeout: false,
        }
    }

    pub fn failed(error_message: impl Into<String>, timeout: bool) -> Self {
        Self {
            status: Status::Failed,
            error_message: Some(error_message.into()),
            timeout,
        }
    }
}

/// The producer-side contract (SPEC_FULL.md §6.3). Implemented by
/// whatever is feeding bytes into a `SendStream` -- a file reader, a
/// message queue, etc. Calls happen synchronously from within the
/// single cooperative loop, never concurrently.
pub trait Producer: Send {
    /// Called once per ACK event that newly acknowledges bytes.
    /// Returns an EOF hint: true means the producer considers the
    /// stream's payload fully handed off.
    fn on_sent_raw_data(&mut self, bytes_acked: usize) -> bool;

    /// Called exactly once when the stream reaches COMPLETION.
    fn on_send_complete(&mut self, outcome: Outcome);

    /// Whether the producer believes it has handed off every byte it
    /// intends to send. Consulted only for diagnostics when reporting
    /// completion (mirrors `consumer.is_done()` in the original).
    fn is_done(&self) -> bool {
        true
    }
}

/// The consumer-side contract (SPEC_FULL.md §6.4).
pub trait Consumer: Send {
    /// Called with each newly-in-order chunk of bytes. Returns an EOF
    /// hint: true means the consumer considers the stream done.
    fn on_received_raw_data(&mut self, data: Vec<u8>) -> bool;

    /// Called exactly once when the stream reaches COMPLETION.
    fn on_receive_complete(&mut self, outcome: Outcome);
}
