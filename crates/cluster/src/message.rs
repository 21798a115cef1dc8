//! Inter-CN pipeline wire messages.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! magic "TDPM" | version u32 | cmd u8 | sid u8 | id u64 | uuid [16] | len u32 | data
//! ```
//!
//! `id` is the registration id on the destination; `uuid` addresses the wait
//! register; `data` is one Arrow IPC stream. Every batch stream terminates
//! with exactly one `MessageEnd` per destination receiver.

use bytes::{Buf, BufMut, BytesMut};
use tidal_common::TidalError;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

const FRAME_MAGIC: &[u8; 4] = b"TDPM";
const FRAME_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 1 + 1 + 8 + 16 + 4;
const MAX_DATA_LEN: usize = 256 * 1024 * 1024;

/// Message command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Batch payload for a registered receiver.
    BatchMessage,
    /// Reachability probe.
    Ping,
    /// Probe reply.
    Pong,
}

impl Cmd {
    fn to_byte(self) -> u8 {
        match self {
            Cmd::BatchMessage => 0,
            Cmd::Ping => 1,
            Cmd::Pong => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TidalError> {
        Ok(match b {
            0 => Cmd::BatchMessage,
            1 => Cmd::Ping,
            2 => Cmd::Pong,
            other => return Err(TidalError::Rpc(format!("unknown cmd byte {other}"))),
        })
    }
}

/// Stream state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sid {
    /// Live payload.
    Normal,
    /// End-of-stream sentinel; the only end signal on the wire.
    MessageEnd,
}

impl Sid {
    fn to_byte(self) -> u8 {
        match self {
            Sid::Normal => 0,
            Sid::MessageEnd => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TidalError> {
        Ok(match b {
            0 => Sid::Normal,
            1 => Sid::MessageEnd,
            other => return Err(TidalError::Rpc(format!("unknown sid byte {other}"))),
        })
    }
}

/// One pipeline message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMessage {
    /// Registration id on the destination CN.
    pub id: u64,
    /// Command.
    pub cmd: Cmd,
    /// Stream state.
    pub sid: Sid,
    /// Destination register key.
    pub uuid: Uuid,
    /// Length-prefixed serialized batch.
    pub data: Vec<u8>,
}

impl PipelineMessage {
    /// A batch payload addressed to `uuid`.
    pub fn batch(uuid: Uuid, data: Vec<u8>) -> Self {
        Self {
            id: 0,
            cmd: Cmd::BatchMessage,
            sid: Sid::Normal,
            uuid,
            data: Vec::from(data),
        }
    }

    /// The end sentinel for `uuid`.
    pub fn end(uuid: Uuid) -> Self {
        Self {
            id: 0,
            cmd: Cmd::BatchMessage,
            sid: Sid::MessageEnd,
            uuid,
            data: Vec::new(),
        }
    }

    /// A ping probe.
    pub fn ping() -> Self {
        Self {
            id: 0,
            cmd: Cmd::Ping,
            sid: Sid::Normal,
            uuid: Uuid::nil(),
            data: Vec::new(),
        }
    }

    /// The ping reply.
    pub fn pong() -> Self {
        Self {
            id: 0,
            cmd: Cmd::Pong,
            sid: Sid::Normal,
            uuid: Uuid::nil(),
            data: Vec::new(),
        }
    }
}

/// Frame codec for [`PipelineMessage`].
#[derive(Debug, Default)]
pub struct PipelineCodec;

impl Encoder<PipelineMessage> for PipelineCodec {
    type Error = TidalError;

    fn encode(&mut self, msg: PipelineMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.data.len() > MAX_DATA_LEN {
            return Err(TidalError::Rpc(format!(
                "pipeline payload of {} bytes exceeds frame limit",
                msg.data.len()
            )));
        }
        dst.reserve(HEADER_LEN + msg.data.len());
        dst.put_slice(FRAME_MAGIC);
        dst.put_u32_le(FRAME_VERSION);
        dst.put_u8(msg.cmd.to_byte());
        dst.put_u8(msg.sid.to_byte());
        dst.put_u64_le(msg.id);
        dst.put_slice(msg.uuid.as_bytes());
        dst.put_u32_le(msg.data.len() as u32);
        dst.put_slice(&msg.data);
        Ok(())
    }
}

impl Decoder for PipelineCodec {
    type Item = PipelineMessage;
    type Error = TidalError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if &src[0..4] != FRAME_MAGIC {
            return Err(TidalError::Rpc("bad pipeline frame magic".to_string()));
        }
        let data_len =
            u32::from_le_bytes([src[34], src[35], src[36], src[37]]) as usize;
        if data_len > MAX_DATA_LEN {
            return Err(TidalError::Rpc(format!(
                "pipeline payload of {data_len} bytes exceeds frame limit"
            )));
        }
        if src.len() < HEADER_LEN + data_len {
            src.reserve(HEADER_LEN + data_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let version = src.get_u32_le();
        if version != FRAME_VERSION {
            return Err(TidalError::Rpc(format!(
                "unsupported pipeline frame version {version}"
            )));
        }
        let cmd = Cmd::from_byte(src.get_u8())?;
        let sid = Sid::from_byte(src.get_u8())?;
        let id = src.get_u64_le();
        let mut uuid_bytes = [0u8; 16];
        src.copy_to_slice(&mut uuid_bytes);
        let uuid = Uuid::from_bytes(uuid_bytes);
        src.advance(4);
        let data = src.split_to(data_len).to_vec();
        Ok(Some(PipelineMessage {
            id,
            cmd,
            sid,
            uuid,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let uuid = Uuid::new_v4();
        let msg = PipelineMessage {
            id: 42,
            cmd: Cmd::BatchMessage,
            sid: Sid::Normal,
            uuid,
            data: vec![1, 2, 3, 4, 5],
        };
        let mut buf = BytesMut::new();
        PipelineCodec
            .encode(msg.clone(), &mut buf)
            .expect("encode");
        let decoded = PipelineCodec.decode(&mut buf).expect("decode").expect("one");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut buf = BytesMut::new();
        PipelineCodec
            .encode(PipelineMessage::end(Uuid::new_v4()), &mut buf)
            .expect("encode");
        let mut partial = buf.split_to(10);
        assert!(PipelineCodec.decode(&mut partial).expect("ok").is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::new();
        PipelineCodec
            .encode(PipelineMessage::ping(), &mut buf)
            .expect("encode");
        buf[0] = b'X';
        assert!(PipelineCodec.decode(&mut buf).is_err());
    }
}
