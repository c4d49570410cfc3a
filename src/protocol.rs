//! Wire protocol: packet layout, message model and shared constants.
//!
//! Every packet is `[id: u32 LE][length: u32 LE][payload]`. Payloads are
//! UTF-8 JSON: a control message tagged by `event`, a `long` fragment of an
//! oversized message, or a stream frame (`open`/chunk/`end`) carrying file
//! bodies multiplexed over the same packet sequence.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed packet header: 4-byte id + 4-byte payload length, little-endian.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Framer accumulation buffer. Must hold the largest packet a peer may send.
pub const FRAMER_BUFFER_SIZE: usize = 64 * 1024;

/// Largest legal payload; anything bigger is a framing defect.
pub const MAX_PACKET_PAYLOAD: usize = FRAMER_BUFFER_SIZE - PACKET_HEADER_SIZE;

/// Serialized messages at or above this size are fragmented into `long` parts.
pub const LONG_MESSAGE_THRESHOLD: usize = 16 * 1024;

/// Size of one `long` fragment's data, before JSON encoding.
pub const LONG_PART_SIZE: usize = 4 * 1024;

/// Raw bytes carried per stream chunk.
pub const STREAM_CHUNK_SIZE: usize = 2048;

/// Cap on pooled out-of-order packets or chunks. A gap that outlives this
/// many buffered units means the missing unit is never coming.
pub const MAX_REORDER_POOL: usize = 1024;

/// Connection-level failure taxonomy. `Io` and `Framing`-class errors are
/// fatal to the connection; the rest are reported and survivable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet payload of {0} bytes exceeds {MAX_PACKET_PAYLOAD}")]
    OversizedPacket(usize),
    #[error("reorder pool exceeded {MAX_REORDER_POOL} entries")]
    ReorderOverflow,
    #[error("malformed payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("chunk for unknown stream {0}")]
    StrayChunk(u32),
    #[error("end for unknown stream {0}")]
    StrayEnd(u32),
    #[error("stream {stream_id} ended with {missing} buffered chunk(s) undeliverable")]
    MissingChunks { stream_id: u32, missing: usize },
    #[error("long message truncated: final part never arrived")]
    TruncatedLongMessage,
    #[error("long message reassembled into another long part")]
    NestedLongMessage,
}

impl ProtocolError {
    /// Whether the connection can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::ReorderOverflow
                | ProtocolError::TruncatedLongMessage
        )
    }
}

/// One framed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Header + payload, ready for the transport.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Parse a complete header, returning `(id, payload_length)`.
pub fn parse_header(header: &[u8; PACKET_HEADER_SIZE]) -> (u32, usize) {
    let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (id, len as usize)
}

/// File or directory, as reported in change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Kind of live change a stream or message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Remove,
}

/// One file inside a [`DirectoryNode`]: remote path plus the id of the
/// preloading stream carrying its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry(pub String, pub u32);

/// Recursive snapshot of one directory subtree. Paths are root-relative
/// with `/` separators; the shared root itself is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub path: String,
    pub files: Vec<FileEntry>,
    pub children: Vec<DirectoryNode>,
}

/// Application metadata attached to a stream open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Set on snapshot streams sent ahead of the `sync` response.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preloading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ChangeKind>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StreamInfo {
    pub fn preloading() -> Self {
        Self {
            preloading: true,
            ..Self::default()
        }
    }

    pub fn change(event: ChangeKind, entry: EntryKind, path: String) -> Self {
        Self {
            preloading: false,
            event: Some(event),
            entry: Some(entry),
            path: Some(path),
        }
    }
}

/// Application-level control message, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Message {
    /// Request (`data` empty) or response (`data` filled) of a listing.
    Inspect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<String>>,
    },
    /// Request (`dir` names an optional remote subtree) or snapshot
    /// response (`data` carries the tree).
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<DirectoryNode>,
    },
    Create {
        #[serde(rename = "type")]
        entry: EntryKind,
        path: String,
    },
    Update {
        #[serde(rename = "type")]
        entry: EntryKind,
        path: String,
    },
    Remove {
        #[serde(rename = "type")]
        entry: EntryKind,
        path: String,
    },
    Error { data: String },
}

impl Message {
    pub fn sync_request(dir: Option<String>) -> Self {
        Message::Sync { dir, data: None }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Message::Error { data: data.into() }
    }
}

/// One fragment of a message too large for a single packet. Parts are
/// concatenated in packet order; `last` marks the final one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongPart {
    pub long: bool,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<bool>,
}

/// Stream sub-protocol frames, multiplexed over the packet sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Chunk {
        #[serde(rename = "streamId")]
        stream_id: u32,
        order: u32,
        buffer: Vec<u8>,
    },
    Open {
        #[serde(rename = "streamId")]
        stream_id: u32,
        open: bool,
        info: StreamInfo,
    },
    End {
        #[serde(rename = "streamId")]
        stream_id: u32,
        end: bool,
    },
}

/// Anything that may arrive in one packet payload. Variant order matters:
/// stream frames carry `streamId`, long parts carry `long`, and control
/// messages carry `event`, so untagged probing is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireFrame {
    Stream(StreamFrame),
    Long(LongPart),
    Message(Message),
}

/// Serialize a wire value into one or more packet payloads, splitting
/// oversized messages into ordered `long` parts.
pub fn encode_payloads<T: Serialize>(value: &T) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let text = serde_json::to_string(value)?;
    if text.len() < LONG_MESSAGE_THRESHOLD {
        return Ok(vec![text.into_bytes()]);
    }
    let parts = split_utf8(&text, LONG_PART_SIZE);
    let count = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            let part = LongPart {
                long: true,
                data: data.to_string(),
                last: (i + 1 == count).then_some(true),
            };
            Ok(serde_json::to_vec(&part)?)
        })
        .collect()
}

/// Split `text` into pieces of at most `size` bytes, never inside a UTF-8
/// sequence.
fn split_utf8(text: &str, size: usize) -> Vec<&str> {
    let mut parts = Vec::with_capacity(text.len() / size + 1);
    let mut rest = text;
    while rest.len() > size {
        let mut cut = size;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);
    parts
}
