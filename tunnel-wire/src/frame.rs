//! A handwritten RFC 6455 §5.2 frame codec.
//!
//! The broker and agent both speak this directly over the session socket
//! once it has left HTTP mode (§4.5/§4.6 of the design). It deliberately
//! does not pull in a general-purpose WebSocket framing crate for this
//! side of the wire: the session is a private channel between two trusted
//! peers, so the codec only needs to support what they actually send.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{WireError, WireResult};

/// Soft read deadline applied to a single `decode_message` call. Expiring
/// with no bytes consumed is not an error — it's a spurious wake the pumps
/// loop past. Expiring mid-frame is, since the peer has left us holding a
/// half-read message.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames larger than this are rejected rather than allocated. The session
/// socket is trusted, but an agent or broker bug (or a future untrusted
/// peer) shouldn't be able to force an unbounded allocation from a single
/// two-byte header.
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

/// The wire opcodes this codec understands. RFC 6455 reserves the rest for
/// extensions the bridge never negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn is_continuation(self) -> bool {
        matches!(self, Opcode::Continuation)
    }
}

/// One fully reassembled message: the opcode of its initial frame and the
/// concatenated payload of every continuation frame that followed it.
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// What a single `decode_message` call produced.
pub enum Decoded {
    Message(Message),
    /// The 30-second deadline elapsed before any byte of a new frame
    /// arrived. Not an error — the caller should loop and wait again.
    NoMessage,
}

/// Writes one frame per call: FIN always set, no reserved bits, no mask.
/// Matches §4.6 — unmasked frames between two trusted peers.
pub async fn encode_message<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | opcode.as_u8());

    let len = payload.len();
    if len < 126 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one logical message, reassembling continuation frames until FIN,
/// under the soft 30-second deadline described on [`READ_TIMEOUT`].
pub async fn decode_message<R>(reader: &mut R) -> WireResult<Decoded>
where
    R: AsyncRead + Unpin,
{
    let mut consumed_any = false;
    match timeout(READ_TIMEOUT, decode_message_inner(reader, &mut consumed_any)).await {
        Ok(result) => result.map(Decoded::Message),
        Err(_elapsed) => {
            if consumed_any {
                Err(WireError::Timeout)
            } else {
                Ok(Decoded::NoMessage)
            }
        }
    }
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b).await?;
    Ok(b[0])
}

async fn decode_message_inner<R>(reader: &mut R, consumed_any: &mut bool) -> WireResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut assembled: Option<(Opcode, Vec<u8>)> = None;

    loop {
        let b0 = read_u8(reader).await?;
        *consumed_any = true;
        let b1 = read_u8(reader).await?;

        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)
            .ok_or_else(|| WireError::MalformedFrame(format!("unknown opcode {:#x}", b0 & 0x0F)))?;
        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        let len: u64 = match len7 {
            126 => {
                let mut buf = [0u8; 2];
                reader.read_exact(&mut buf).await?;
                u16::from_be_bytes(buf) as u64
            }
            127 => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf).await?;
                u64::from_be_bytes(buf)
            }
            n => n as u64,
        };

        if len > MAX_FRAME_PAYLOAD {
            return Err(WireError::MalformedFrame(format!(
                "frame payload {len} exceeds {MAX_FRAME_PAYLOAD} byte limit"
            )));
        }

        // Real RFC 6455 peers mask client frames; this codec never sets the
        // bit on write, but tolerates it on read rather than rejecting a
        // well-formed frame from a future or misbehaving peer.
        let mask = if masked {
            let mut m = [0u8; 4];
            reader.read_exact(&mut m).await?;
            Some(m)
        } else {
            None
        };

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        if let Some(m) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= m[i % 4];
            }
        }

        if opcode.is_continuation() {
            let (_, buf) = assembled
                .as_mut()
                .ok_or_else(|| WireError::ProtocolViolation("continuation frame with no preceding initial frame".into()))?;
            buf.extend_from_slice(&payload);
        } else {
            if assembled.is_some() {
                return Err(WireError::ProtocolViolation(
                    "new frame started before the previous message's FIN".into(),
                ));
            }
            assembled = Some((opcode, payload));
        }

        if fin {
            let (opcode, payload) = assembled.expect("set above on the first frame of every message");
            return Ok(Message { opcode, payload });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(opcode: Opcode, payload: Vec<u8>) {
        let (mut a, mut b) = duplex(payload.len() + 1024);
        encode_message(&mut a, opcode, &payload).await.unwrap();
        drop(a);
        let decoded = decode_message(&mut b).await.unwrap();
        match decoded {
            Decoded::Message(msg) => {
                assert_eq!(msg.opcode, opcode);
                assert_eq!(msg.payload, payload);
            }
            Decoded::NoMessage => panic!("expected a message"),
        }
    }

    #[tokio::test]
    async fn round_trips_boundary_lengths() {
        for len in [0usize, 125, 126, 65535, 65536, 1 << 20] {
            let payload = vec![0x5Au8; len];
            round_trip(Opcode::Binary, payload).await;
        }
    }

    #[tokio::test]
    async fn round_trips_text() {
        round_trip(Opcode::Text, b"hello".to_vec()).await;
    }

    #[tokio::test]
    async fn decodes_masked_frames_for_forward_compat() {
        let (mut a, mut b) = duplex(64);
        // Hand-build a masked binary frame: FIN=1, opcode=binary, masked, len=3.
        let mask = [0x01, 0x02, 0x03, 0x04];
        let payload = [b'a', b'b', b'c'];
        let mut masked_payload = payload;
        for (i, byte) in masked_payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
        let mut frame = vec![0x80 | 0x2, 0x80 | 3];
        frame.extend_from_slice(&mask);
        frame.extend_from_slice(&masked_payload);
        a.write_all(&frame).await.unwrap();
        drop(a);

        let Decoded::Message(msg) = decode_message(&mut b).await.unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.opcode, Opcode::Binary);
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    async fn rejects_continuation_before_initial_frame() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0x80 | 0x0, 0x00]).await.unwrap(); // FIN continuation, empty
        drop(a);
        let err = decode_message(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn reassembles_fragmented_message() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0x00 | 0x1, 0x02, b'h', b'i']).await.unwrap(); // non-FIN text
        a.write_all(&[0x80 | 0x0, 0x03, b'!', b'!', b'!'])
            .await
            .unwrap(); // FIN continuation
        drop(a);
        let Decoded::Message(msg) = decode_message(&mut b).await.unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload, b"hi!!!");
    }
}
