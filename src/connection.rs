//! One bidirectional channel over a TCP socket.
//!
//! A [`Connection`] composes the framer, the reorder buffer, long-message
//! reassembly and the stream multiplexer: the read half is driven by a
//! spawned task that turns raw bytes into [`ConnectionEvent`]s, while sends
//! go through a locked write half so packet ids always match wire order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::framing::{PacketFramer, ReorderBuffer};
use crate::protocol::{
    encode_payloads, Message, Packet, ProtocolError, StreamFrame, StreamInfo, WireFrame,
    MAX_REORDER_POOL, STREAM_CHUNK_SIZE,
};

/// What a connection surfaces to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A fully reassembled control message.
    Message(Message),
    /// A newly opened incoming stream and its metadata.
    Stream(IncomingStream),
    /// A protocol defect. Fatal ones are followed by `Closed`.
    Error(ProtocolError),
    /// The transport ended; no further events follow.
    Closed,
}

/// Readable side of one multiplexed stream. Chunks arrive already in
/// per-stream order; the channel closing signals end-of-data.
#[derive(Debug)]
pub struct IncomingStream {
    pub id: u32,
    pub info: StreamInfo,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl IncomingStream {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Drain the whole body into memory.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk);
        }
        buf
    }

    /// Drain the body into `out`, returning the byte count.
    pub async fn write_to<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> std::io::Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.rx.recv().await {
            out.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(total)
    }
}

struct WriteState {
    half: OwnedWriteHalf,
    next_packet_id: u32,
}

struct Shared {
    write: Mutex<WriteState>,
    next_stream_id: AtomicU32,
}

/// Handle to one live connection. Cheap to clone; the read task runs until
/// the transport closes or a fatal framing error occurs.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Wrap an established socket. Returns the handle and the event
    /// receiver; the caller owns event consumption.
    pub fn new(socket: TcpStream) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let _ = socket.set_nodelay(true);
        let (read_half, write_half) = socket.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(read_half, events_tx));
        let connection = Self {
            shared: Arc::new(Shared {
                write: Mutex::new(WriteState {
                    half: write_half,
                    next_packet_id: 1,
                }),
                next_stream_id: AtomicU32::new(1),
            }),
        };
        (connection, events_rx)
    }

    /// Send one control message, fragmenting if it exceeds the single-packet
    /// threshold. Resolves once the bytes are handed to the transport.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_value(message).await
    }

    /// Open an outgoing multiplexed stream and return a writer for its
    /// chunks.
    pub async fn open_stream(&self, info: StreamInfo) -> Result<StreamWriter> {
        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.send_value(&StreamFrame::Open {
            stream_id,
            open: true,
            info,
        })
        .await?;
        Ok(StreamWriter {
            connection: self.clone(),
            stream_id,
            next_order: 1,
        })
    }

    /// Pipe an entire byte source through a fresh stream: open, chunked
    /// writes, end. Returns the stream id.
    pub async fn stream<R: AsyncRead + Unpin>(&self, mut source: R, info: StreamInfo) -> Result<u32> {
        let mut writer = self.open_stream(info).await?;
        let id = writer.id();
        let mut buf = vec![0u8; 8 * STREAM_CHUNK_SIZE];
        loop {
            let n = source.read(&mut buf).await.context("stream source read")?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.end().await?;
        Ok(id)
    }

    /// Half-close the transport. The peer observes end-of-stream.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.shared.write.lock().await;
        state.half.shutdown().await?;
        Ok(())
    }

    async fn send_value<T: Serialize>(&self, value: &T) -> Result<()> {
        let payloads = encode_payloads(value)?;
        let mut state = self.shared.write.lock().await;
        for payload in payloads {
            let id = state.next_packet_id;
            state.next_packet_id += 1;
            let packet = Packet::new(id, payload);
            state.half.write_all(&packet.encode()).await?;
        }
        Ok(())
    }
}

/// Writable side of one outgoing multiplexed stream. Chunk order is
/// assigned here, starting at 1.
pub struct StreamWriter {
    connection: Connection,
    stream_id: u32,
    next_order: u32,
}

impl StreamWriter {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Write a slice as one or more ordered chunks.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(STREAM_CHUNK_SIZE) {
            let order = self.next_order;
            self.next_order += 1;
            self.connection
                .send_value(&StreamFrame::Chunk {
                    stream_id: self.stream_id,
                    order,
                    buffer: chunk.to_vec(),
                })
                .await?;
        }
        Ok(())
    }

    /// Terminate the stream. No chunks may follow.
    pub async fn end(self) -> Result<()> {
        self.connection
            .send_value(&StreamFrame::End {
                stream_id: self.stream_id,
                end: true,
            })
            .await
    }
}

struct IncomingStreamState {
    next_order: u32,
    pool: HashMap<u32, Vec<u8>>,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Receive-side demultiplexer: long-message reassembly plus per-stream
/// chunk reordering. Fed with packets already in id order.
struct Dispatcher {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    long_buf: String,
    long_active: bool,
    streams: HashMap<u32, IncomingStreamState>,
}

impl Dispatcher {
    fn new(events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            events,
            long_buf: String::new(),
            long_active: false,
            streams: HashMap::new(),
        }
    }

    fn dispatch(&mut self, packet: Packet) -> Result<(), ProtocolError> {
        if packet.payload.is_empty() {
            // Legal on the wire, carries nothing.
            return Ok(());
        }
        trace!(id = packet.id, len = packet.payload.len(), "packet");
        let frame: WireFrame = serde_json::from_slice(&packet.payload)?;
        self.dispatch_frame(frame, false)
    }

    fn dispatch_frame(&mut self, frame: WireFrame, reassembled: bool) -> Result<(), ProtocolError> {
        match frame {
            WireFrame::Long(part) => {
                if reassembled {
                    return Err(ProtocolError::NestedLongMessage);
                }
                self.long_active = true;
                self.long_buf.push_str(&part.data);
                if part.last == Some(true) {
                    let text = std::mem::take(&mut self.long_buf);
                    self.long_active = false;
                    let inner: WireFrame = serde_json::from_str(&text)?;
                    self.dispatch_frame(inner, true)?;
                }
                Ok(())
            }
            WireFrame::Stream(frame) => self.dispatch_stream(frame),
            WireFrame::Message(message) => {
                let _ = self.events.send(ConnectionEvent::Message(message));
                Ok(())
            }
        }
    }

    fn dispatch_stream(&mut self, frame: StreamFrame) -> Result<(), ProtocolError> {
        match frame {
            StreamFrame::Open { stream_id, info, .. } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.streams.insert(
                    stream_id,
                    IncomingStreamState {
                        next_order: 1,
                        pool: HashMap::new(),
                        tx,
                    },
                );
                let _ = self.events.send(ConnectionEvent::Stream(IncomingStream {
                    id: stream_id,
                    info,
                    rx,
                }));
                Ok(())
            }
            StreamFrame::Chunk {
                stream_id,
                order,
                buffer,
            } => {
                let state = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or(ProtocolError::StrayChunk(stream_id))?;
                if order != state.next_order {
                    if state.pool.len() >= MAX_REORDER_POOL {
                        return Err(ProtocolError::ReorderOverflow);
                    }
                    state.pool.insert(order, buffer);
                    return Ok(());
                }
                let _ = state.tx.send(Bytes::from(buffer));
                state.next_order += 1;
                while let Some(next) = state.pool.remove(&state.next_order) {
                    let _ = state.tx.send(Bytes::from(next));
                    state.next_order += 1;
                }
                Ok(())
            }
            StreamFrame::End { stream_id, .. } => {
                let state = self
                    .streams
                    .remove(&stream_id)
                    .ok_or(ProtocolError::StrayEnd(stream_id))?;
                // End waits for drain; by the time it arrives here, every
                // chunk in order has already been pushed. Anything still
                // pooled sits behind a gap no future chunk may fill.
                if !state.pool.is_empty() {
                    return Err(ProtocolError::MissingChunks {
                        stream_id,
                        missing: state.pool.len(),
                    });
                }
                Ok(())
            }
        }
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let mut framer = PacketFramer::new();
    let mut reorder = ReorderBuffer::new();
    let mut dispatcher = Dispatcher::new(events.clone());
    let mut buf = vec![0u8; 16 * 1024];
    'io: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                if dispatcher.long_active {
                    let _ = events.send(ConnectionEvent::Error(
                        ProtocolError::TruncatedLongMessage,
                    ));
                }
                break;
            }
            Ok(n) => {
                let mut framed = Vec::new();
                if let Err(err) = framer.push(&buf[..n], &mut framed) {
                    let _ = events.send(ConnectionEvent::Error(err));
                    break;
                }
                let mut ordered = Vec::new();
                for packet in framed {
                    if let Err(err) = reorder.accept(packet, &mut ordered) {
                        let _ = events.send(ConnectionEvent::Error(err));
                        break 'io;
                    }
                }
                for packet in ordered {
                    if let Err(err) = dispatcher.dispatch(packet) {
                        let fatal = err.is_fatal();
                        let _ = events.send(ConnectionEvent::Error(err));
                        if fatal {
                            break 'io;
                        }
                    }
                }
            }
            Err(err) => {
                let _ = events.send(ConnectionEvent::Error(ProtocolError::Io(err)));
                break;
            }
        }
    }
    // Dropping the dispatcher drops every stream sender, ending their
    // bodies for any reader still draining.
    let _ = events.send(ConnectionEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChangeKind, EntryKind, LongPart, LONG_MESSAGE_THRESHOLD};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn message_round_trip() {
        let (a, b) = socket_pair().await;
        let (sender, _events_a) = Connection::new(a);
        let (_receiver, mut events_b) = Connection::new(b);

        let msg = Message::Create {
            entry: EntryKind::Dir,
            path: "sub/dir".into(),
        };
        sender.send(&msg).await.unwrap();

        match events_b.recv().await.unwrap() {
            ConnectionEvent::Message(got) => assert_eq!(got, msg),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_message_round_trip() {
        let (a, b) = socket_pair().await;
        let (sender, _events_a) = Connection::new(a);
        let (_receiver, mut events_b) = Connection::new(b);

        // Forces fragmentation into long parts.
        let msg = Message::error("y".repeat(LONG_MESSAGE_THRESHOLD * 3));
        sender.send(&msg).await.unwrap();

        match events_b.recv().await.unwrap() {
            ConnectionEvent::Message(got) => assert_eq!(got, msg),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unterminated_long_message_surfaces_error_not_partial() {
        let (mut raw, b) = socket_pair().await;
        let (_receiver, mut events_b) = Connection::new(b);

        // A long part that never announces `last`, then EOF. The partial
        // accumulator must not leak out as a message.
        let part = LongPart {
            long: true,
            data: r#"{"event":"err"#.into(),
            last: None,
        };
        let packet = Packet::new(1, serde_json::to_vec(&part).unwrap());
        raw.write_all(&packet.encode()).await.unwrap();
        raw.shutdown().await.unwrap();

        match events_b.recv().await.unwrap() {
            ConnectionEvent::Error(ProtocolError::TruncatedLongMessage) => {}
            other => panic!("unexpected event {other:?}"),
        }
        match events_b.recv().await.unwrap() {
            ConnectionEvent::Closed => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_round_trip_preserves_bytes() {
        let (a, b) = socket_pair().await;
        let (sender, _events_a) = Connection::new(a);
        let (_receiver, mut events_b) = Connection::new(b);

        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let info = StreamInfo::change(ChangeKind::Update, EntryKind::File, "f.bin".into());
        sender.stream(&body[..], info.clone()).await.unwrap();

        match events_b.recv().await.unwrap() {
            ConnectionEvent::Stream(stream) => {
                assert_eq!(stream.info, info);
                assert_eq!(stream.read_to_end().await, body);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn interleaved_streams_stay_independent() {
        let (a, b) = socket_pair().await;
        let (sender, _events_a) = Connection::new(a);
        let (_receiver, mut events_b) = Connection::new(b);

        let mut s1 = sender.open_stream(StreamInfo::preloading()).await.unwrap();
        let mut s2 = sender.open_stream(StreamInfo::preloading()).await.unwrap();
        s1.write(b"one-").await.unwrap();
        s2.write(b"two-").await.unwrap();
        s1.write(b"first").await.unwrap();
        s2.write(b"second").await.unwrap();
        s1.end().await.unwrap();
        s2.end().await.unwrap();

        let mut bodies = Vec::new();
        for _ in 0..2 {
            match events_b.recv().await.unwrap() {
                ConnectionEvent::Stream(stream) => bodies.push(stream.read_to_end().await),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(bodies[0], b"one-first");
        assert_eq!(bodies[1], b"two-second");
    }

    #[tokio::test]
    async fn close_surfaces_closed_event() {
        let (a, b) = socket_pair().await;
        let (sender, _events_a) = Connection::new(a);
        let (_receiver, mut events_b) = Connection::new(b);
        sender.close().await.unwrap();
        match events_b.recv().await.unwrap() {
            ConnectionEvent::Closed => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Chunk reordering is exercised at the dispatcher level, where arrival
    // order can be controlled directly.
    #[tokio::test]
    async fn chunks_delivered_in_order_for_any_arrival() {
        let permutations: &[&[u32]] = &[
            &[1, 2, 3, 4],
            &[4, 3, 2, 1],
            &[2, 1, 4, 3],
            &[3, 4, 1, 2],
        ];
        for arrival in permutations {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut dispatcher = Dispatcher::new(tx);
            dispatcher
                .dispatch_stream(StreamFrame::Open {
                    stream_id: 1,
                    open: true,
                    info: StreamInfo::default(),
                })
                .unwrap();
            for &order in *arrival {
                dispatcher
                    .dispatch_stream(StreamFrame::Chunk {
                        stream_id: 1,
                        order,
                        buffer: vec![order as u8],
                    })
                    .unwrap();
            }
            dispatcher
                .dispatch_stream(StreamFrame::End {
                    stream_id: 1,
                    end: true,
                })
                .unwrap();

            let stream = match rx.recv().await.unwrap() {
                ConnectionEvent::Stream(s) => s,
                other => panic!("unexpected event {other:?}"),
            };
            assert_eq!(stream.read_to_end().await, vec![1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn end_with_missing_chunk_is_protocol_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(tx);
        dispatcher
            .dispatch_stream(StreamFrame::Open {
                stream_id: 9,
                open: true,
                info: StreamInfo::default(),
            })
            .unwrap();
        // Chunk 2 arrives, chunk 1 never does.
        dispatcher
            .dispatch_stream(StreamFrame::Chunk {
                stream_id: 9,
                order: 2,
                buffer: vec![2],
            })
            .unwrap();
        let err = dispatcher
            .dispatch_stream(StreamFrame::End {
                stream_id: 9,
                end: true,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingChunks {
                stream_id: 9,
                missing: 1
            }
        ));
        // The stream body ends without the buffered chunk.
        let stream = match rx.recv().await.unwrap() {
            ConnectionEvent::Stream(s) => s,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(stream.read_to_end().await, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn chunk_for_unknown_stream_is_stray() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(tx);
        let err = dispatcher
            .dispatch_stream(StreamFrame::Chunk {
                stream_id: 5,
                order: 1,
                buffer: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StrayChunk(5)));
        assert!(!err.is_fatal());
    }
}
