//! Timestamped event records and the total order used to process them.
//!
//! A [`Message`] is a cheap handle (an `Arc` around a fixed header plus an
//! immutable payload) so that the same logical record can be referenced
//! from a thread's queue, from the destination LP's processed-message
//! history, and from the remote-match map without copying the payload.
//! `flags` is the one field every holder can mutate, and it is exactly the
//! small state machine described in spec §4.1: `PROCESSED` is set once, by
//! the destination thread, at extraction time; `ANTI` can be set by any
//! thread that later delivers the matching anti-message.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Identifier of a logical process.
pub type LpId = usize;

/// Process-wide unique identifier of a message, used as the local half of
/// the remote-match map's `(msg_id, origin_node)` key.
pub type MessageId = u64;

/// Bit set once, by the destination thread, when the message is extracted
/// from the queue and handed to the dispatcher. The extraction is the
/// commit point for this transition; see spec §5 on atomic ordering.
pub const PROCESSED: u32 = 1 << 0;

/// Bit set, by any thread, when an anti-message cancels this message. If
/// the positive is still queued this makes its next extraction a no-op; if
/// it was already processed it must be rolled back.
pub const ANTI: u32 = 1 << 1;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata only meaningful for a message crossing a node boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMeta {
    pub origin_node: u32,
    pub origin_thread: u32,
    pub gvt_phase_bit: bool,
    /// Per-(origin, destination_node, phase) sequence counter used to
    /// rendezvous positive and anti-messages in [`crate::remote_match`].
    pub m_seq: u64,
}

#[derive(Debug)]
struct MessageInner {
    id: MessageId,
    dest: LpId,
    sender: LpId,
    dest_t: f64,
    send_time: f64,
    m_type: u32,
    payload: Vec<u8>,
    flags: AtomicU32,
    remote: Option<RemoteMeta>,
}

/// A timestamped event record.
///
/// Cloning a `Message` clones the handle, not the payload: all clones share
/// the same `flags` word, which is exactly what lets a producer (holding a
/// `p_msgs` record for anti-message generation) and a consumer (holding the
/// queue entry) observe each other's updates.
#[derive(Debug, Clone)]
pub struct Message(Arc<MessageInner>);

impl Message {
    /// Allocate a new message. Mirrors spec §4.1's `pack`; the only failure
    /// mode is host allocator OOM, which this crate treats like the spec
    /// does elsewhere for unrecoverable allocation failure: abort with a
    /// fatal log rather than propagate a `Result` nobody can act on.
    pub fn pack(sender: LpId, dest: LpId, send_time: f64, dest_t: f64, m_type: u32, payload: Vec<u8>) -> Self {
        let id = NEXT_MESSAGE_ID.fetch_add(1, AtomicOrdering::Relaxed);
        Message(Arc::new(MessageInner {
            id,
            dest,
            sender,
            dest_t,
            send_time,
            m_type,
            payload,
            flags: AtomicU32::new(0),
            remote: None,
        }))
    }

    /// Pack a plain-old-data event payload without a manual `to_vec` at
    /// every call site. Mirrors the `Pod + Zeroable` bound the teacher puts
    /// on its generic message type; here the bound lands on this one
    /// constructor instead of the whole `Message` type, since payloads are
    /// opaque bytes everywhere else in this crate.
    pub fn pack_pod<T: bytemuck::Pod>(sender: LpId, dest: LpId, send_time: f64, dest_t: f64, m_type: u32, payload: &T) -> Self {
        Self::pack(sender, dest, send_time, dest_t, m_type, bytemuck::bytes_of(payload).to_vec())
    }

    /// Reinterpret this message's payload as `T`, if the byte length
    /// matches. Returns `None` rather than panicking on a mismatched event
    /// type, since a model dispatching on `m_type` controls which `T` is
    /// expected for any given message.
    pub fn payload_as<T: bytemuck::Pod>(&self) -> Option<&T> {
        bytemuck::try_from_bytes(&self.0.payload).ok()
    }

    /// Allocate a message that crossed a node boundary.
    pub fn pack_remote(
        sender: LpId,
        dest: LpId,
        send_time: f64,
        dest_t: f64,
        m_type: u32,
        payload: Vec<u8>,
        remote: RemoteMeta,
    ) -> Self {
        let id = NEXT_MESSAGE_ID.fetch_add(1, AtomicOrdering::Relaxed);
        Message(Arc::new(MessageInner {
            id,
            dest,
            sender,
            dest_t,
            send_time,
            m_type,
            payload,
            flags: AtomicU32::new(0),
            remote: Some(remote),
        }))
    }

    pub fn id(&self) -> MessageId {
        self.0.id
    }

    pub fn dest(&self) -> LpId {
        self.0.dest
    }

    pub fn sender(&self) -> LpId {
        self.0.sender
    }

    pub fn dest_t(&self) -> f64 {
        self.0.dest_t
    }

    pub fn send_time(&self) -> f64 {
        self.0.send_time
    }

    pub fn m_type(&self) -> u32 {
        self.0.m_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    pub fn remote(&self) -> Option<RemoteMeta> {
        self.0.remote
    }

    pub fn is_remote(&self) -> bool {
        self.0.remote.is_some()
    }

    /// `bare_size` from spec §4.1: header overhead plus the payload.
    pub fn bare_size(&self) -> usize {
        std::mem::size_of::<MessageInner>() + self.0.payload.len()
    }

    /// Every producer/consumer pair for a given message is serialized by
    /// the destination's bound-thread guarantee (spec §5), so relaxed
    /// ordering on the flags word is sufficient: the only cross-thread
    /// transitions are `0 -> PROCESSED` and `* -> *|ANTI`, and the flags
    /// word itself is the arbiter of which one happened first.
    pub fn flags(&self) -> u32 {
        self.0.flags.load(AtomicOrdering::Relaxed)
    }

    /// Extraction's commit point: mark this message processed and return
    /// the flags word as it was immediately before.
    pub fn mark_processed(&self) -> u32 {
        self.0.flags.fetch_or(PROCESSED, AtomicOrdering::Relaxed)
    }

    /// Mark this message canceled by an anti-message and return the flags
    /// word as it was immediately before.
    pub fn mark_anti(&self) -> u32 {
        self.0.flags.fetch_or(ANTI, AtomicOrdering::Relaxed)
    }

    /// Rollback of a locally processed entry: clear `PROCESSED` so the next
    /// extraction treats the message as fresh again. Returns the flags word
    /// as it was immediately before, so the caller can check `is_anti`
    /// without a second load racing a concurrent anti-message delivery.
    pub fn clear_processed(&self) -> u32 {
        self.0.flags.fetch_and(!PROCESSED, AtomicOrdering::Relaxed)
    }

    pub fn is_processed(&self) -> bool {
        self.flags() & PROCESSED != 0
    }

    pub fn is_anti(&self) -> bool {
        self.flags() & ANTI != 0
    }

    /// Number of outstanding handles to this message. Used by the fossil
    /// collector as a debug assertion that a committed message really is
    /// about to be freed rather than silently leaked.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Message {}

/// Total order `a ≺ b` from spec §3: `dest_t` first, then a deterministic
/// chain of tie-breaks on `m_type` (descending), payload size (ascending),
/// and finally a reverse `memcmp` of the payload bytes. If every tie-break
/// is exhausted the two messages are equivalent, not unequal: `msg_is_before`
/// is a strict weak ordering, not a total order over identity.
pub fn msg_is_before(a: &Message, b: &Message) -> bool {
    cmp_order(a, b) == Ordering::Less
}

fn cmp_order(a: &Message, b: &Message) -> Ordering {
    a.dest_t()
        .partial_cmp(&b.dest_t())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.m_type().cmp(&a.m_type()))
        .then_with(|| a.payload().len().cmp(&b.payload().len()))
        .then_with(|| b.payload().cmp(a.payload()))
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(cmp_order(self, other))
    }
}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_order(self, other)
    }
}
