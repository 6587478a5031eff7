use std::collections::HashMap;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::endpoint::Endpoint;

/// FNV-1 32-bit over the concatenated ids. Collisions are possible, so
/// every hash lookup is confirmed with an ordered id comparison.
fn hash_ids<'a>(ids: impl Iterator<Item = &'a str>) -> u32 {
    let mut hash: u32 = 2166136261;
    for id in ids {
        for byte in id.bytes() {
            hash = hash.wrapping_mul(16777619);
            hash ^= byte as u32;
        }
    }
    hash
}

fn hash_endpoints(endpoints: &[Endpoint]) -> u32 {
    hash_ids(endpoints.iter().map(|e| e.id()))
}

fn same_endpoints(ids: &[String], endpoints: &[Endpoint]) -> bool {
    ids.len() == endpoints.len()
        && ids
            .iter()
            .zip(endpoints.iter())
            .all(|(id, endpoint)| id == endpoint.id())
}

/// Round-robin position bound to one specific ordered endpoint set.
#[derive(Debug)]
struct Cursor {
    position: usize,
    hash: u32,
    endpoint_ids: Vec<String>,
    expires_at: i64,
    /// Index of this cursor's entry in the expiry heap, maintained by
    /// every heap operation so refresh stays O(log n).
    heap_pos: usize,
}

/// TTL'd table of round-robin cursors. Cursors live in an arena of slots;
/// the expiry min-heap and the hash index both address slots by arena
/// index, which stands in for the back-pointer a heap entry would
/// otherwise need.
pub struct CursorTable {
    slots: Vec<Option<Cursor>>,
    free: Vec<usize>,
    by_hash: HashMap<u32, Vec<usize>>,
    heap: Vec<usize>,
}

impl Default for CursorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_hash: HashMap::new(),
            heap: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns the slot of the cursor for this exact endpoint sequence,
    /// refreshing its expiry, or allocates a fresh cursor at position zero
    /// when the sequence has not been seen before.
    pub fn upsert(&mut self, endpoints: &[Endpoint], expires_at: i64) -> usize {
        if let Some(slot) = self.find(endpoints) {
            self.refresh(slot, expires_at);
            return slot;
        }
        let cursor = Cursor {
            position: 0,
            hash: hash_endpoints(endpoints),
            endpoint_ids: endpoints.iter().map(|e| e.id().to_string()).collect(),
            expires_at,
            heap_pos: 0,
        };
        let hash = cursor.hash;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(cursor);
                slot
            }
            None => {
                self.slots.push(Some(cursor));
                self.slots.len() - 1
            }
        };
        self.by_hash.entry(hash).or_default().push(slot);
        self.heap_push(slot);
        slot
    }

    fn find(&self, endpoints: &[Endpoint]) -> Option<usize> {
        let hash = hash_endpoints(endpoints);
        self.by_hash.get(&hash)?.iter().copied().find(|&slot| {
            self.slots[slot]
                .as_ref()
                .is_some_and(|c| same_endpoints(&c.endpoint_ids, endpoints))
        })
    }

    /// Advances the cursor one step modulo the set size, skipping inactive
    /// endpoints. One full revolution without an active endpoint means
    /// there is nothing to hand out.
    pub fn advance(&mut self, slot: usize, endpoints: &[Endpoint]) -> ProxyResult<usize> {
        let cursor = self.slots[slot]
            .as_mut()
            .ok_or(ProxyError::NoEndpoints)?;
        if endpoints.is_empty() {
            return Err(ProxyError::NoEndpoints);
        }
        if cursor.position >= endpoints.len() {
            cursor.position = 0;
        }
        for _ in 0..endpoints.len() {
            let candidate = cursor.position;
            cursor.position = (cursor.position + 1) % endpoints.len();
            if endpoints[candidate].is_active() {
                return Ok(candidate);
            }
            tracing::debug!("skipping inactive endpoint: {}", endpoints[candidate].id());
        }
        Err(ProxyError::NoEndpoints)
    }

    /// Upsert plus advance: the everyday selection call.
    pub fn next(&mut self, endpoints: &[Endpoint], expires_at: i64) -> ProxyResult<usize> {
        let slot = self.upsert(endpoints, expires_at);
        self.advance(slot, endpoints)
    }

    /// Removes every cursor whose expiry is at or before `now`. Idempotent.
    pub fn gc(&mut self, now: i64) {
        while let Some(&root) = self.heap.first() {
            let expires_at = self.slots[root]
                .as_ref()
                .map(|c| c.expires_at)
                .unwrap_or(i64::MIN);
            if expires_at > now {
                break;
            }
            let slot = self.heap_pop_root();
            self.release(slot);
        }
    }

    fn release(&mut self, slot: usize) {
        if let Some(cursor) = self.slots[slot].take() {
            if let Some(slots) = self.by_hash.get_mut(&cursor.hash) {
                slots.retain(|&s| s != slot);
                if slots.is_empty() {
                    self.by_hash.remove(&cursor.hash);
                }
            }
            self.free.push(slot);
        }
    }

    fn refresh(&mut self, slot: usize, expires_at: i64) {
        let pos = {
            let cursor = self.slots[slot].as_mut().expect("refresh of a live cursor");
            cursor.expires_at = expires_at;
            cursor.heap_pos
        };
        self.sift_down(pos);
        self.sift_up(pos);
    }

    fn expiry_of(&self, slot: usize) -> i64 {
        self.slots[slot]
            .as_ref()
            .map(|c| c.expires_at)
            .unwrap_or(i64::MIN)
    }

    fn heap_swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for pos in [a, b] {
            let slot = self.heap[pos];
            if let Some(cursor) = self.slots[slot].as_mut() {
                cursor.heap_pos = pos;
            }
        }
    }

    fn heap_push(&mut self, slot: usize) {
        self.heap.push(slot);
        let pos = self.heap.len() - 1;
        if let Some(cursor) = self.slots[slot].as_mut() {
            cursor.heap_pos = pos;
        }
        self.sift_up(pos);
    }

    fn heap_pop_root(&mut self) -> usize {
        let last = self.heap.len() - 1;
        self.heap_swap(0, last);
        let slot = self.heap.pop().expect("pop of a non-empty heap");
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        slot
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.expiry_of(self.heap[pos]) < self.expiry_of(self.heap[parent]) {
                self.heap_swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.heap.len()
                && self.expiry_of(self.heap[left]) < self.expiry_of(self.heap[smallest])
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.expiry_of(self.heap[right]) < self.expiry_of(self.heap[smallest])
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heap_swap(pos, smallest);
            pos = smallest;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        assert_eq!(live, self.heap.len(), "heap size must equal live cursors");
        let indexed: usize = self.by_hash.values().map(|v| v.len()).sum();
        assert_eq!(indexed, live, "hash index must cover every live cursor");
        for (pos, &slot) in self.heap.iter().enumerate() {
            let cursor = self.slots[slot].as_ref().expect("heap points at live slot");
            assert_eq!(cursor.heap_pos, pos, "heap back-reference out of sync");
            if pos > 0 {
                let parent = self.heap[(pos - 1) / 2];
                assert!(
                    self.slots[parent].as_ref().unwrap().expires_at <= cursor.expires_at,
                    "heap order violated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn endpoints(ids: &[&str]) -> Vec<Endpoint> {
        ids.iter()
            .map(|id| Endpoint::new(*id, Url::parse("http://backend.example").unwrap()))
            .collect()
    }

    #[test]
    fn upsert_returns_the_same_cursor_for_the_same_sequence() {
        let mut table = CursorTable::new();
        let set = endpoints(&["a", "b", "c"]);

        let first = table.upsert(&set, 100);
        let second = table.upsert(&set, 200);

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        table.check_invariants();
    }

    #[test]
    fn different_sequences_get_different_cursors() {
        let mut table = CursorTable::new();
        let a = table.upsert(&endpoints(&["a", "b"]), 100);
        let b = table.upsert(&endpoints(&["a", "b", "c"]), 100);
        let c = table.upsert(&endpoints(&["b", "a"]), 100);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 3);
        table.check_invariants();
    }

    #[test]
    fn advance_walks_the_set_in_order() {
        let mut table = CursorTable::new();
        let set = endpoints(&["a", "b", "c"]);

        assert_eq!(table.next(&set, 100).unwrap(), 0);
        assert_eq!(table.next(&set, 100).unwrap(), 1);
        assert_eq!(table.next(&set, 100).unwrap(), 2);
        assert_eq!(table.next(&set, 100).unwrap(), 0);
    }

    #[test]
    fn advance_skips_inactive_endpoints() {
        let mut table = CursorTable::new();
        let mut set = endpoints(&["a", "b", "c"]);
        set[1].set_active(false);

        assert_eq!(table.next(&set, 100).unwrap(), 0);
        assert_eq!(table.next(&set, 100).unwrap(), 2);
        assert_eq!(table.next(&set, 100).unwrap(), 0);
    }

    #[test]
    fn full_revolution_without_active_endpoints_errors() {
        let mut table = CursorTable::new();
        let mut set = endpoints(&["a", "b"]);
        set[0].set_active(false);
        set[1].set_active(false);

        assert!(table.next(&set, 100).is_err());
    }

    #[test]
    fn gc_removes_everything_at_or_before_now() {
        let mut table = CursorTable::new();
        table.upsert(&endpoints(&["a"]), 50);
        table.upsert(&endpoints(&["b"]), 100);
        table.upsert(&endpoints(&["c"]), 150);

        table.gc(100);

        assert_eq!(table.len(), 1);
        table.check_invariants();

        // Idempotent: nothing more to collect.
        table.gc(100);
        assert_eq!(table.len(), 1);
        table.check_invariants();
    }

    #[test]
    fn refresh_rescues_a_cursor_from_gc() {
        let mut table = CursorTable::new();
        let set = endpoints(&["a", "b"]);
        table.upsert(&set, 50);
        table.upsert(&set, 500);

        table.gc(100);

        assert_eq!(table.len(), 1);
        table.check_invariants();
    }

    #[test]
    fn slots_are_reused_after_gc() {
        let mut table = CursorTable::new();
        let old = table.upsert(&endpoints(&["a"]), 50);
        table.gc(50);
        let reused = table.upsert(&endpoints(&["b"]), 100);
        assert_eq!(old, reused);
        table.check_invariants();
    }

    #[test]
    fn heap_survives_many_interleaved_operations() {
        let mut table = CursorTable::new();
        for round in 0..20i64 {
            for name in ["a", "b", "c", "d", "e"] {
                let set = endpoints(&[name, "shared"]);
                table.upsert(&set, 100 + round * 7 + name.len() as i64);
            }
            table.gc(90 + round * 6);
            table.check_invariants();
        }
    }

    #[test]
    fn position_resets_when_the_set_shrinks_under_a_stale_cursor() {
        let mut table = CursorTable::new();
        let set = endpoints(&["a", "b", "c"]);
        table.next(&set, 100).unwrap();
        table.next(&set, 100).unwrap();

        // Same slot, shorter list: position must clamp instead of indexing
        // out of bounds.
        let slot = table.upsert(&set, 100);
        let short = endpoints(&["a"]);
        assert_eq!(table.advance(slot, &short).unwrap(), 0);
    }
}
