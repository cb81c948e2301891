//! Wire codec.
//!
//! Frame layout: `type (1 byte) | seq (4 bytes BE) | length (4 bytes BE) |
//! payload`. The payload is UTF-8 JSON carrying a [`P2pMessage`] or
//! [`P2pResponse`]. `seq` is a per-request correlation token chosen by the
//! sender, not a clock.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::P2pError;

/// Protocol version carried in every payload. Receivers drop mismatches.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Result codes carried in `P2pResponse.result`.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL_ERROR: i32 = 100;
    pub const METHOD_ERROR: i32 = 101;
    pub const RESOURCE_NOT_FOUND: i32 = 102;
    pub const REMOTE_QUERY_FAILED: i32 = 103;
}

/// Envelope type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0x01,
    ResourceRequest = 0x12,
    ResourceResponse = 0x13,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Heartbeat),
            0x12 => Some(Self::ResourceRequest),
            0x13 => Some(Self::ResourceResponse),
            _ => None,
        }
    }
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub type_code: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            type_code: msg_type as u8,
            seq,
            payload,
        }
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.type_code)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.payload.len());
        buf.push(self.type_code);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, P2pError> {
        if buf.len() < 9 {
            return Err(P2pError::Codec(format!("frame header truncated: {} bytes", buf.len())));
        }
        let type_code = buf[0];
        let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if buf.len() != 9 + len {
            return Err(P2pError::Codec(format!(
                "frame length mismatch: header says {}, got {}",
                len,
                buf.len() - 9
            )));
        }
        Ok(Self {
            type_code,
            seq,
            payload: buf[9..].to_vec(),
        })
    }

    /// Read one complete frame, buffering across partial reads.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame: usize,
    ) -> Result<Self, P2pError> {
        let mut header = [0u8; 9];
        reader.read_exact(&mut header).await?;

        let type_code = header[0];
        let seq = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if len > max_frame {
            return Err(P2pError::FrameTooLarge { len, max: max_frame });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            type_code,
            seq,
            payload,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), P2pError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Application-level request carried as an envelope payload.
///
/// `method` is a bare control verb (`seq`, `requestPeerInfo`) or a
/// four-segment resource path `network/chain/resource/verb`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct P2pMessage<T> {
    pub version: String,
    pub method: String,
    pub seq: u32,
    pub data: T,
}

impl P2pMessage<Value> {
    pub fn new(method: &str, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            method: method.to_string(),
            seq: 0,
            data,
        }
    }
}

impl<T: Serialize> P2pMessage<T> {
    pub fn to_payload(&self) -> Result<Vec<u8>, P2pError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> P2pMessage<T> {
    pub fn from_payload(payload: &[u8]) -> Result<Self, P2pError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Application-level response. `result == 0` is success; `seq` must equal
/// the originating request's seq.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct P2pResponse<T> {
    pub version: String,
    pub seq: u32,
    pub result: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> P2pResponse<T> {
    pub fn success(seq: u32, data: T) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            seq,
            result: status::SUCCESS,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(seq: u32, result: i32, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            seq,
            result,
            message: message.into(),
            data: None,
        }
    }
}

impl<T: Serialize> P2pResponse<T> {
    pub fn to_payload(&self) -> Result<Vec<u8>, P2pError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> P2pResponse<T> {
    pub fn from_payload(payload: &[u8]) -> Result<Self, P2pError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Payload of the `seq` catalog-version announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSeqPayload {
    pub seq: u32,
}

/// Payload answering `requestPeerInfo`: the full catalog snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfoPayload {
    pub seq: u32,
    #[serde(default)]
    pub resources: std::collections::HashMap<String, crate::resource::ResourceInfo>,
}

/// Heartbeat payload: `state == 0` is a probe, `state == 1` the reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub state: u8,
}

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Next correlation seq: process-monotonic, wrapping, never zero.
pub fn next_seq() -> u32 {
    loop {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        if seq != 0 {
            return seq;
        }
    }
}

/// Receivers drop payloads whose version they do not speak.
pub fn version_compatible(version: &str) -> bool {
    version == PROTOCOL_VERSION
}
