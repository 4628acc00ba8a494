//! In-memory message transport.
//!
//! Models the boundary contract of the underlying reliable transport:
//! publications addressed by (channel, stream-id) with non-blocking
//! `offer`/`try_claim` returning a log position on success or a negative
//! sentinel, and polling subscriptions delivering framed fragments.
//! Uses crossbeam channels so multi-member clusters can run in-process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Sentinel returned when a publication has no live subscriber.
pub const NOT_CONNECTED: i64 = -1;

/// Sentinel returned when the receiving mailbox is full.
/// The caller must retry on a later duty-cycle iteration.
pub const BACK_PRESSURED: i64 = -2;

/// Default mailbox capacity per (channel, stream-id) pair.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Frame alignment used for position accounting.
pub const FRAME_ALIGNMENT: i64 = 32;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The channel descriptor could not be parsed or resolved.
    InvalidChannel { channel: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidChannel { channel } => {
                write!(f, "invalid channel descriptor: '{}'", channel)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Per-fragment header delivered alongside the payload on poll.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Stream the fragment arrived on.
    pub stream_id: i32,
    /// Position of the fragment within the sender's publication.
    pub position: i64,
}

/// A framed message in flight.
struct Frame {
    header: Header,
    payload: Vec<u8>,
}

/// Shared state for one (channel, stream-id) mailbox.
struct Mailbox {
    tx: Sender<Frame>,
    /// Taken by the first subscriber; None afterwards.
    rx: Option<Receiver<Frame>>,
    connected: Arc<AtomicBool>,
}

struct Registry {
    mailboxes: HashMap<(String, i32), Mailbox>,
    capacity: usize,
}

impl Registry {
    fn mailbox(&mut self, channel: &str, stream_id: i32) -> &mut Mailbox {
        let capacity = self.capacity;
        self.mailboxes
            .entry((channel.to_string(), stream_id))
            .or_insert_with(|| {
                let (tx, rx) = bounded(capacity);
                Mailbox {
                    tx,
                    rx: Some(rx),
                    connected: Arc::new(AtomicBool::new(true)),
                }
            })
    }
}

/// Handle to the in-memory transport. Cloneable; all clones share the
/// same channel registry. The registry lock is only taken when adding
/// publications/subscriptions or toggling connectivity, never on the
/// per-message send/receive path.
#[derive(Clone)]
pub struct Transport {
    registry: Arc<Mutex<Registry>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    /// Create a transport with a custom mailbox capacity.
    /// Small capacities are useful for exercising backpressure in tests.
    pub fn with_capacity(capacity: usize) -> Self {
        Transport {
            registry: Arc::new(Mutex::new(Registry {
                mailboxes: HashMap::new(),
                capacity,
            })),
        }
    }

    /// Add a publication for (channel, stream-id).
    ///
    /// An empty channel descriptor is invalid. Any other descriptor
    /// resolves to a mailbox, created on first use.
    pub fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, TransportError> {
        if channel.is_empty() {
            return Err(TransportError::InvalidChannel {
                channel: channel.to_string(),
            });
        }

        let mut registry = self.registry.lock().expect("transport registry poisoned");
        let mailbox = registry.mailbox(channel, stream_id);
        Ok(Publication {
            channel: channel.to_string(),
            stream_id,
            tx: mailbox.tx.clone(),
            connected: mailbox.connected.clone(),
            position: 0,
            closed: false,
        })
    }

    /// Add a subscription for (channel, stream-id).
    ///
    /// The mailbox receiver is taken by the first subscription; a second
    /// subscription on the same pair is an invalid channel use.
    pub fn add_subscription(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Subscription, TransportError> {
        if channel.is_empty() {
            return Err(TransportError::InvalidChannel {
                channel: channel.to_string(),
            });
        }

        let mut registry = self.registry.lock().expect("transport registry poisoned");
        let mailbox = registry.mailbox(channel, stream_id);
        let rx = mailbox.rx.take().ok_or_else(|| TransportError::InvalidChannel {
            channel: channel.to_string(),
        })?;
        Ok(Subscription {
            channel: channel.to_string(),
            stream_id,
            rx,
        })
    }

    /// Sever a channel: publications on it return NOT_CONNECTED until
    /// reconnected. Used by fault-injection tests.
    pub fn disconnect(&self, channel: &str) {
        self.set_connected(channel, false);
    }

    /// Restore a previously severed channel.
    pub fn reconnect(&self, channel: &str) {
        self.set_connected(channel, true);
    }

    fn set_connected(&self, channel: &str, connected: bool) {
        let registry = self.registry.lock().expect("transport registry poisoned");
        for ((ch, _), mailbox) in registry.mailboxes.iter() {
            if ch == channel {
                mailbox.connected.store(connected, Ordering::SeqCst);
            }
        }
    }
}

/// Outbound half of a (channel, stream-id) pair.
///
/// Positions increase monotonically per publication, by the frame-aligned
/// message length on each successful offer/claim commit.
pub struct Publication {
    channel: String,
    stream_id: i32,
    tx: Sender<Frame>,
    connected: Arc<AtomicBool>,
    position: i64,
    closed: bool,
}

impl Publication {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Position after the last successful send.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.connected.load(Ordering::SeqCst)
    }

    /// Mark this publication closed. Subsequent offers return NOT_CONNECTED.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Non-blocking send of `length` bytes starting at `offset`.
    ///
    /// Returns the new position on success, or NOT_CONNECTED /
    /// BACK_PRESSURED. Never blocks.
    pub fn offer(&mut self, buffer: &[u8], offset: usize, length: usize) -> i64 {
        if !self.is_connected() {
            return NOT_CONNECTED;
        }

        let payload = buffer[offset..offset + length].to_vec();
        let new_position = self.position + aligned_length(length);
        let frame = Frame {
            header: Header {
                stream_id: self.stream_id,
                position: new_position,
            },
            payload,
        };

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.position = new_position;
                new_position
            }
            Err(TrySendError::Full(_)) => BACK_PRESSURED,
            Err(TrySendError::Disconnected(_)) => NOT_CONNECTED,
        }
    }

    /// Reserve space for a `length`-byte message.
    ///
    /// On success the claim's buffer is ready to be written and committed;
    /// the prospective position is returned. On failure a sentinel is
    /// returned and the claim is left unusable.
    pub fn try_claim(&mut self, length: usize, claim: &mut BufferClaim) -> i64 {
        if !self.is_connected() {
            claim.clear();
            return NOT_CONNECTED;
        }
        if self.tx.is_full() {
            claim.clear();
            return BACK_PRESSURED;
        }

        let new_position = self.position + aligned_length(length);
        claim.prepare(
            length,
            self.tx.clone(),
            Header {
                stream_id: self.stream_id,
                position: new_position,
            },
        );
        self.position = new_position;
        new_position
    }
}

/// A claimed region awaiting commit or abort.
///
/// Reused across claims to avoid reallocating the backing buffer.
#[derive(Default)]
pub struct BufferClaim {
    buffer: Vec<u8>,
    pending: Option<(Sender<Frame>, Header)>,
}

impl BufferClaim {
    pub fn new() -> Self {
        Self::default()
    }

    fn prepare(&mut self, length: usize, tx: Sender<Frame>, header: Header) {
        self.buffer.clear();
        self.buffer.resize(length, 0);
        self.pending = Some((tx, header));
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }

    /// Writable view of the claimed region.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Publish the claimed bytes. A commit without a prior successful
    /// claim is a no-op.
    pub fn commit(&mut self) {
        if let Some((tx, header)) = self.pending.take() {
            let payload = std::mem::take(&mut self.buffer);
            // Capacity was checked at claim time; a full mailbox here just
            // drops the frame, matching at-least-once (not exactly-once)
            // delivery at the boundary.
            let _ = tx.try_send(Frame { header, payload });
        }
    }

    /// Discard the claimed region without publishing.
    pub fn abort(&mut self) {
        self.clear();
    }
}

/// Inbound half of a (channel, stream-id) pair.
pub struct Subscription {
    channel: String,
    stream_id: i32,
    rx: Receiver<Frame>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Poll for up to `fragment_limit` fragments, invoking the handler
    /// with (buffer, offset, length, header) for each. Non-blocking.
    ///
    /// Returns the number of fragments delivered.
    pub fn poll<F>(&mut self, handler: &mut F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], usize, usize, &Header),
    {
        let mut count = 0;
        while count < fragment_limit {
            match self.rx.try_recv() {
                Ok(frame) => {
                    handler(&frame.payload, 0, frame.payload.len(), &frame.header);
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }
}

/// Round a payload length up to the frame alignment for position math.
fn aligned_length(length: usize) -> i64 {
    let len = length as i64;
    (len + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}
