//! On-wire byte layout for the five BitDust UDP transport commands.
//!
//! Every datagram starts with a software-version byte and a command
//! byte. All multi-byte integer and IEEE-754 float fields after that
//! are big-endian (network byte order) -- the two peers MUST agree on
//! this, and this build resolves the original implementation's
//! "native endianness" open question by fixing it to network order and
//! bumping `SOFTWARE_VERSION`.

use crate::config::SOFTWARE_VERSION;
use crate::error::{TransportError, TransportResult};

/// Sentinel block-id meaning "empty block", used as a handshake-time
/// heartbeat. Per SPEC_FULL.md this is keepalive-only: it updates
/// last-block-received-time but never latches EOF by itself.
pub const EMPTY_BLOCK_ID: i32 = -1;

/// Sentinel block-id inside an ACK body that introduces a PAUSE
/// directive instead of acknowledging a block.
pub const PAUSE_SENTINEL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ping = 0,
    Greeting = 1,
    Alive = 2,
    Data = 3,
    Ack = 4,
}

impl Command {
    fn from_byte(b: u8) -> TransportResult<Self> {
        match b {
            0 => Ok(Command::Ping),
            1 => Ok(Command::Greeting),
            2 => Ok(Command::Alive),
            3 => Ok(Command::Data),
            4 => Ok(Command::Ack),
            other => Err(TransportError::MalformedDatagram(format!(
                "unknown command byte {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataDatagram {
    pub stream_id: u32,
    pub total_size: u32,
    pub block_id: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseDirective {
    pub pause_seconds: f32,
    pub receive_limit_bytes_per_sec: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckDatagram {
    pub stream_id: u32,
    pub eof: bool,
    pub acked_block_ids: Vec<i32>,
    pub pause: Option<PauseDirective>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Ping,
    Greeting { peer_id: String, peer_url: String },
    Alive,
    Data(DataDatagram),
    Ack(AckDatagram),
}

impl Datagram {
    pub fn command(&self) -> Command {
        match self {
            Datagram::Ping => Command::Ping,
            Datagram::Greeting { .. } => Command::Greeting,
            Datagram::Alive => Command::Alive,
            Datagram::Data(_) => Command::Data,
            Datagram::Ack(_) => Command::Ack,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![SOFTWARE_VERSION, self.command() as u8];
        match self {
            Datagram::Ping | Datagram::Alive => {}
            Datagram::Greeting { peer_id, peer_url } => {
                bytes.extend(format!("{peer_id} {peer_url}").into_bytes());
            }
            Datagram::Data(d) => {
                bytes.extend(d.stream_id.to_be_bytes());
                bytes.extend(d.total_size.to_be_bytes());
                bytes.extend(d.block_id.to_be_bytes());
                bytes.extend(&d.payload);
            }
            Datagram::Ack(a) => {
                bytes.extend(a.stream_id.to_be_bytes());
                bytes.push(a.eof as u8);
                for block_id in &a.acked_block_ids {
                    bytes.extend(block_id.to_be_bytes());
                }
                if let Some(p) = a.pause {
                    bytes.extend(PAUSE_SENTINEL.to_be_bytes());
                    bytes.extend(p.pause_seconds.to_be_bytes());
                    bytes.extend(p.receive_limit_bytes_per_sec.to_be_bytes());
                }
            }
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        if bytes.len() < 2 {
            return Err(TransportError::MalformedDatagram(
                "datagram shorter than header".into(),
            ));
        }
        let _version = bytes[0];
        let command = Command::from_byte(bytes[1])?;
        let body = &bytes[2..];
        match command {
            Command::Ping => Ok(Datagram::Ping),
            Command::Alive => Ok(Datagram::Alive),
            Command::Greeting => {
                let text = std::str::from_utf8(body).map_err(|e| {
                    TransportError::MalformedDatagram(format!("GREETING not utf8: {e}"))
                })?;
                let mut parts = text.splitn(2, ' ');
                let peer_id = parts.next().unwrap_or_default().to_string();
                let peer_url = parts.next().ok_or_else(|| {
                    TransportError::MalformedDatagram("GREETING missing peer-url".into())
                })?;
                Ok(Datagram::Greeting {
                    peer_id,
                    peer_url: peer_url.to_string(),
                })
            }
            Command::Data => decode_data(body),
            Command::Ack => decode_ack(body),
        }
    }
}

fn take4(body: &[u8], at: usize, what: &str) -> TransportResult<[u8; 4]> {
    body.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| TransportError::MalformedDatagram(format!("truncated {what}")))
}

fn decode_data(body: &[u8]) -> TransportResult<Datagram> {
    if body.len() < 12 {
        return Err(TransportError::MalformedDatagram(
            "DATA shorter than fixed fields".into(),
        ));
    }
    let stream_id = u32::from_be_bytes(take4(body, 0, "stream_id")?);
    let total_size = u32::from_be_bytes(take4(body, 4, "total_size")?);
    let block_id = i32::from_be_bytes(take4(body, 8, "block_id")?);
    let payload = body[12..].to_vec();
    Ok(Datagram::Data(DataDatagram {
        stream_id,
        total_size,
        block_id,
        payload,
    }))
}

fn decode_ack(body: &[u8]) -> TransportResult<Datagram> {
    if body.len() < 5 {
        return Err(TransportError::MalformedDatagram(
            "ACK shorter than fixed fields".into(),
        ));
    }
    let stream_id = u32::from_be_bytes(take4(body, 0, "stream_id")?);
    let eof = body[4] != 0;
    let mut rest = &body[5..];
    let mut acked_block_ids = Vec::new();
    let mut pause = None;
    while !rest.is_empty() {
        let block_id = i32::from_be_bytes(take4(rest, 0, "ack block_id")?);
        rest = &rest[4..];
        if block_id == PAUSE_SENTINEL {
            let pause_seconds = f32::from_be_bytes(take4(rest, 0, "pause seconds")?);
            rest = &rest[4..];
            let receive_limit_bytes_per_sec = f32::from_be_bytes(take4(rest, 0, "pause limit")?);
            rest = &rest[4..];
            pause = Some(PauseDirective {
                pause_seconds,
                receive_limit_bytes_per_sec,
            });
        } else {
            acked_block_ids.push(block_id);
        }
    }
    Ok(Datagram::Ack(AckDatagram {
        stream_id,
        eof,
        acked_block_ids,
        pause,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UDP_DATAGRAM_MAX_SIZE;

    #[test]
    fn ping_alive_roundtrip() {
        for d in [Datagram::Ping, Datagram::Alive] {
            let bytes = d.encode();
            assert_eq!(Datagram::decode(&bytes).unwrap(), d);
        }
    }

    #[test]
    fn greeting_roundtrip() {
        let d = Datagram::Greeting {
            peer_id: "alice".into(),
            peer_url: "http://example.com/alice.xml".into(),
        };
        let bytes = d.encode();
        assert_eq!(Datagram::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn data_roundtrip_including_empty_block() {
        let d = Datagram::Data(DataDatagram {
            stream_id: 7,
            total_size: 10_000,
            block_id: EMPTY_BLOCK_ID,
            payload: vec![],
        });
        let bytes = d.encode();
        assert!(bytes.len() <= UDP_DATAGRAM_MAX_SIZE);
        assert_eq!(Datagram::decode(&bytes).unwrap(), d);

        let d2 = Datagram::Data(DataDatagram {
            stream_id: 7,
            total_size: 10_000,
            block_id: 1,
            payload: vec![1, 2, 3, 4],
        });
        let bytes2 = d2.encode();
        assert_eq!(Datagram::decode(&bytes2).unwrap(), d2);
    }

    #[test]
    fn ack_roundtrip_plain() {
        let d = Datagram::Ack(AckDatagram {
            stream_id: 3,
            eof: true,
            acked_block_ids: vec![1, 2, 3],
            pause: None,
        });
        let bytes = d.encode();
        assert_eq!(Datagram::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn ack_roundtrip_with_pause() {
        let d = Datagram::Ack(AckDatagram {
            stream_id: 3,
            eof: false,
            acked_block_ids: vec![5],
            pause: Some(PauseDirective {
                pause_seconds: 2.5,
                receive_limit_bytes_per_sec: 10_000.0,
            }),
        });
        let bytes = d.encode();
        assert_eq!(Datagram::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn truncated_data_is_malformed_not_a_panic() {
        let bytes = vec![SOFTWARE_VERSION, Command::Data as u8, 0, 0];
        assert!(Datagram::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_command_is_malformed() {
        let bytes = vec![SOFTWARE_VERSION, 0xFF];
        assert!(Datagram::decode(&bytes).is_err());
    }

    #[test]
    fn block_size_budget_keeps_datagram_under_max() {
        let d = Datagram::Data(DataDatagram {
            stream_id: u32::MAX,
            total_size: u32::MAX,
            block_id: i32::MAX,
            payload: vec![0u8; crate::config::BLOCK_SIZE],
        });
        assert_eq!(d.encode().len(), UDP_DATAGRAM_MAX_SIZE);
    }
}
