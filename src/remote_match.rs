//! Remote-message matching map (spec §4.6): rendezvous point for
//! inter-node positive/anti-message pairs that can arrive in either
//! order.
//!
//! Keyed by `(msg_id, origin_node)` with robin-hood open addressing to
//! keep probe sequences short and bounded. The spec describes the
//! per-slot lock as a high bit in the stored `msg_id` released by an
//! atomic subtract; this crate gets the same "only the slot being
//! touched is contended" property from a `Vec<Mutex<Slot>>` instead,
//! which is the same trade the thread message queue makes in
//! [`crate::queue`] and for the same reason: no unsafe spinning on a
//! shared word when a per-element lock already gives exclusive access at
//! the right granularity.

use std::sync::Mutex;

use crate::message::Message;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub msg_id: u64,
    pub origin_node: u32,
}

#[derive(Clone)]
enum Slot {
    Empty,
    /// A positive message is resident, waiting for its anti-message (or
    /// for GVT to fossil it away) or simply parked here until the
    /// dispatch loop consumes it.
    Positive { key: MatchKey, lifetime_bound: f64, msg: Message, probe: u32 },
    /// An anti-message arrived before its positive twin.
    AntiWaiting { key: MatchKey, lifetime_bound: f64, probe: u32 },
}

impl Slot {
    fn probe(&self) -> u32 {
        match self {
            Slot::Empty => 0,
            Slot::Positive { probe, .. } => *probe,
            Slot::AntiWaiting { probe, .. } => *probe,
        }
    }

    fn key(&self) -> Option<MatchKey> {
        match self {
            Slot::Empty => None,
            Slot::Positive { key, .. } => Some(*key),
            Slot::AntiWaiting { key, .. } => Some(*key),
        }
    }
}

fn hash_key(key: MatchKey, capacity: usize) -> usize {
    let mixed = key.msg_id.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(key.origin_node as u64);
    (mixed as usize) % capacity
}

/// Outcome of [`RemoteMatchMap::arrive_positive`] / `arrive_anti`.
pub enum MatchOutcome {
    /// Nothing else to do; the arrival was parked for later rendezvous.
    Parked,
    /// The positive and anti twin matched; the positive `Message` is
    /// returned so the caller can apply the `ANTI` flag and re-queue it
    /// if it was already processed.
    Cancel(Message),
}

pub struct RemoteMatchMap {
    slots: Vec<Mutex<Slot>>,
    len: usize,
}

impl RemoteMatchMap {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(8).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(Slot::Empty));
        }
        RemoteMatchMap { slots, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.slots.len() as f64
    }

    fn insert_robin_hood(&self, mut incoming: Slot) {
        let capacity = self.slots.len();
        let mut idx = hash_key(incoming.key().expect("inserted slot must carry a key"), capacity);
        let mut dist = 0u32;
        loop {
            let mut slot = self.slots[idx].lock().unwrap();
            match &*slot {
                Slot::Empty => {
                    set_probe(&mut incoming, dist);
                    *slot = incoming;
                    return;
                }
                _ => {
                    let resident_dist = slot.probe();
                    if resident_dist < dist {
                        // Robin hood: the poorer (farther-displaced) entry
                        // keeps the slot; swap and keep walking with what
                        // was here before.
                        set_probe(&mut incoming, dist);
                        std::mem::swap(&mut *slot, &mut incoming);
                        dist = incoming.probe();
                    }
                }
            }
            idx = (idx + 1) % capacity;
            dist += 1;
        }
    }

    fn find_and_take(&self, key: MatchKey) -> Option<Slot> {
        let capacity = self.slots.len();
        let mut idx = hash_key(key, capacity);
        let mut dist = 0u32;
        loop {
            let mut slot = self.slots[idx].lock().unwrap();
            match &*slot {
                Slot::Empty => return None,
                other if other.probe() < dist => return None,
                other if other.key() == Some(key) => {
                    let taken = std::mem::replace(&mut *slot, Slot::Empty);
                    return Some(taken);
                }
                _ => {}
            }
            idx = (idx + 1) % capacity;
            dist += 1;
            if dist as usize > capacity {
                return None;
            }
        }
    }

    /// A positive message arrived from the transport. If a matching
    /// `AntiWaiting` entry is already resident, they cancel immediately;
    /// otherwise the positive is parked for the anti-message to find
    /// later.
    pub fn arrive_positive(&mut self, key: MatchKey, lifetime_bound: f64, msg: Message) -> MatchOutcome {
        match self.find_and_take(key) {
            Some(Slot::AntiWaiting { .. }) => {
                self.len -= 1;
                MatchOutcome::Cancel(msg)
            }
            Some(other) => {
                // A duplicate positive for the same key should not occur
                // under the protocol; leave the resident entry untouched
                // and park this one under robin-hood displacement.
                self.insert_robin_hood(other);
                self.len += 1;
                self.insert_robin_hood(Slot::Positive { key, lifetime_bound, msg, probe: 0 });
                MatchOutcome::Parked
            }
            None => {
                self.len += 1;
                self.insert_robin_hood(Slot::Positive { key, lifetime_bound, msg, probe: 0 });
                MatchOutcome::Parked
            }
        }
    }

    /// An anti-message arrived from the transport. If the positive is
    /// already resident, it is returned for cancellation; otherwise this
    /// anti-message is parked to wait for the positive.
    pub fn arrive_anti(&mut self, key: MatchKey, lifetime_bound: f64) -> MatchOutcome {
        if let Some(taken) = self.find_and_take(key) {
            if let Slot::Positive { msg, .. } = taken {
                self.len -= 1;
                return MatchOutcome::Cancel(msg);
            }
            self.insert_robin_hood(taken);
        }
        self.len += 1;
        self.insert_robin_hood(Slot::AntiWaiting { key, lifetime_bound, probe: 0 });
        MatchOutcome::Parked
    }

    /// Resize to `new_capacity`, replaying every still-active slot into
    /// the fresh table. Must run under the GVT barrier per spec §4.6.
    pub fn resize(&mut self, new_capacity: usize) {
        let fresh = RemoteMatchMap::with_capacity(new_capacity);
        for slot in &self.slots {
            let taken = std::mem::replace(&mut *slot.lock().unwrap(), Slot::Empty);
            if !matches!(taken, Slot::Empty) {
                fresh.insert_robin_hood(taken);
            }
        }
        self.slots = fresh.slots;
    }

    /// Fossil collection: drop any parked entry whose `lifetime_bound` is
    /// below the current GVT. An entry surviving past its lifetime bound
    /// with no twin ever arriving is the `early_anti`-at-`LP_FINI` case
    /// from spec §8's boundary properties.
    pub fn fossil(&mut self, gvt: f64) {
        for slot in &self.slots {
            let mut guard = slot.lock().unwrap();
            let expired = match &*guard {
                Slot::Positive { lifetime_bound, .. } | Slot::AntiWaiting { lifetime_bound, .. } => {
                    *lifetime_bound < gvt
                }
                Slot::Empty => false,
            };
            if expired {
                self.len -= 1;
                *guard = Slot::Empty;
            }
        }
    }
}

fn set_probe(slot: &mut Slot, probe: u32) {
    match slot {
        Slot::Positive { probe: p, .. } => *p = probe,
        Slot::AntiWaiting { probe: p, .. } => *p = probe,
        Slot::Empty => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::pack(0, 1, 0.0, 1.0, 0, vec![])
    }

    #[test]
    fn positive_then_anti_cancels() {
        let mut map = RemoteMatchMap::with_capacity(8);
        let key = MatchKey { msg_id: 1, origin_node: 2 };
        assert!(matches!(map.arrive_positive(key, 10.0, msg()), MatchOutcome::Parked));
        assert!(matches!(map.arrive_anti(key, 10.0), MatchOutcome::Cancel(_)));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn anti_then_positive_cancels() {
        let mut map = RemoteMatchMap::with_capacity(8);
        let key = MatchKey { msg_id: 5, origin_node: 9 };
        assert!(matches!(map.arrive_anti(key, 10.0), MatchOutcome::Parked));
        assert!(matches!(map.arrive_positive(key, 10.0, msg()), MatchOutcome::Cancel(_)));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn unrelated_keys_do_not_interfere() {
        let mut map = RemoteMatchMap::with_capacity(8);
        let a = MatchKey { msg_id: 1, origin_node: 1 };
        let b = MatchKey { msg_id: 2, origin_node: 1 };
        assert!(matches!(map.arrive_positive(a, 10.0, msg()), MatchOutcome::Parked));
        assert!(matches!(map.arrive_anti(b, 10.0), MatchOutcome::Parked));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn fossil_drops_expired_parked_entries() {
        let mut map = RemoteMatchMap::with_capacity(8);
        let key = MatchKey { msg_id: 1, origin_node: 1 };
        map.arrive_anti(key, 3.0);
        map.fossil(5.0);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn resize_preserves_active_entries() {
        let mut map = RemoteMatchMap::with_capacity(8);
        let key = MatchKey { msg_id: 42, origin_node: 7 };
        map.arrive_anti(key, 10.0);
        map.resize(32);
        assert_eq!(map.capacity(), 32);
        assert!(matches!(map.arrive_positive(key, 10.0, msg()), MatchOutcome::Cancel(_)));
    }
}
