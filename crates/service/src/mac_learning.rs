use crate::Timestamp;

use ahash::{HashMap, HashMapExt};
use codec::flow::EthernetAddress;

/// Capacity bound of the learning table.
pub const MAX_ENTRIES: usize = 2048;

/// Age (seconds since last use) past which an entry is invisible to lookup.
pub const AGE_HARD: u64 = 300;

/// Age past which an entry is removed outright by maintenance.
pub const AGE_MAX: u64 = 3600;

/// How long a gratuitous-ARP lock refuses updates, in seconds.
pub const GRAT_ARP_LOCK: u64 = 5;

const NIL: usize = usize::MAX;

/// Gratuitous-ARP handling for one `learn` call.
///
/// A gratuitous ARP briefly makes a station appear on the wrong port; a
/// caller that recognizes one can arm a lock on the entry so that the churn
/// is suppressed. The switch core itself never arms it — the hook exists
/// for policy layered above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GratArpLock {
    /// Ignore any lock state.
    None,
    /// Arm the lock on the learned entry.
    Set,
    /// Honor an armed lock: refuse the update while it holds.
    Check,
}

type Key = (EthernetAddress, u16);

struct Entry {
    key: Key,
    port_no: u16,
    learned_at: Timestamp,
    used_at: Timestamp,
    /// Gratuitous-ARP lock expiry; 0 means unlocked.
    lock_until: Timestamp,
    prev: usize,
    next: usize,
}

/// The source-address learning table: a bounded map from (station address,
/// VLAN) to the port the station was last seen on.
///
/// Entries sit on a doubly-linked recency list threaded through a slab;
/// refreshing an entry moves it to the most-recent end, and inserting into
/// a full table evicts the least-recently-used entry. Because refreshes
/// also update `used_at`, the list is ordered by last use, which lets
/// maintenance expire old entries from the cold end in O(expired).
///
/// # Test
///
/// ```
/// use lswitch_service::mac_learning::{GratArpLock, MacLearning};
/// use codec::flow::EthernetAddress;
///
/// let station = EthernetAddress([0, 0x11, 0x22, 0x33, 0x44, 0x55]);
/// let mut table = MacLearning::new();
///
/// assert!(!table.learn(station, 0, 1, GratArpLock::None, 100));
/// assert_eq!(table.lookup(station, 0, 100), Some(1));
///
/// // Same station on another port: a move.
/// assert!(table.learn(station, 0, 2, GratArpLock::None, 101));
/// assert_eq!(table.lookup(station, 0, 101), Some(2));
///
/// // Unknown key, and per-VLAN separation.
/// assert_eq!(table.lookup(EthernetAddress([9; 6]), 0, 101), None);
/// assert_eq!(table.lookup(station, 7, 101), None);
/// ```
pub struct MacLearning {
    slab: Vec<Entry>,
    map: HashMap<Key, usize>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl Default for MacLearning {
    fn default() -> Self {
        Self::new()
    }
}

impl MacLearning {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Vec::new(),
            map: HashMap::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record that `src` (on `vlan`) was seen on `port_no`.
    ///
    /// Returns `true` exactly when an existing entry pointed at a different
    /// port — a station move. Multicast and all-zero sources are never
    /// learned.
    pub fn learn(
        &mut self,
        src: EthernetAddress,
        vlan: u16,
        port_no: u16,
        lock: GratArpLock,
        now: Timestamp,
    ) -> bool {
        if src.is_multicast() || src.is_zero() {
            return false;
        }

        let key = (src, vlan);
        if let Some(&index) = self.map.get(&key) {
            let entry = &mut self.slab[index];

            if lock == GratArpLock::Check && now < entry.lock_until {
                return false;
            }

            if lock == GratArpLock::Set {
                entry.lock_until = now + GRAT_ARP_LOCK;
            }

            let moved = entry.port_no != port_no;
            if moved {
                entry.port_no = port_no;
                entry.learned_at = now;
            }

            entry.used_at = now;
            self.touch(index);
            return moved;
        }

        if self.map.len() >= self.capacity {
            self.remove(self.head);
        }

        let entry = Entry {
            key,
            port_no,
            learned_at: now,
            used_at: now,
            lock_until: if lock == GratArpLock::Set {
                now + GRAT_ARP_LOCK
            } else {
                0
            },
            prev: NIL,
            next: NIL,
        };

        let index = if let Some(index) = self.free.pop() {
            self.slab[index] = entry;
            index
        } else {
            self.slab.push(entry);
            self.slab.len() - 1
        };

        self.map.insert(key, index);
        self.push_tail(index);
        false
    }

    /// The port `dst` (on `vlan`) was last seen on. Unknown keys, entries
    /// unused for more than [`AGE_HARD`] seconds, and entries under an
    /// armed gratuitous-ARP lock all answer `None`.
    pub fn lookup(&self, dst: EthernetAddress, vlan: u16, now: Timestamp) -> Option<u16> {
        let entry = &self.slab[*self.map.get(&(dst, vlan))?];

        if now > entry.used_at + AGE_HARD || now < entry.lock_until {
            return None;
        }

        Some(entry.port_no)
    }

    /// Opportunistic maintenance: drop every entry unused for more than
    /// [`AGE_MAX`] seconds. The recency list is ordered by last use, so
    /// this walks only the expired cold end.
    pub fn run(&mut self, now: Timestamp) {
        while self.head != NIL && now > self.slab[self.head].used_at + AGE_MAX {
            self.remove(self.head);
        }
    }

    /// The earliest instant at which [`run`](Self::run) will have work, or
    /// `None` while the table is empty.
    pub fn wait_until(&self, now: Timestamp) -> Option<Timestamp> {
        if self.head == NIL {
            return None;
        }

        Some((self.slab[self.head].used_at + AGE_MAX).max(now))
    }

    fn remove(&mut self, index: usize) {
        self.unlink(index);
        self.map.remove(&self.slab[index].key);
        self.free.push(index);
    }

    fn touch(&mut self, index: usize) {
        if self.tail != index {
            self.unlink(index);
            self.push_tail(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let Entry { prev, next, .. } = self.slab[index];

        match prev {
            NIL => self.head = next,
            _ => self.slab[prev].next = next,
        }

        match next {
            NIL => self.tail = prev,
            _ => self.slab[next].prev = prev,
        }
    }

    fn push_tail(&mut self, index: usize) {
        self.slab[index].prev = self.tail;
        self.slab[index].next = NIL;

        match self.tail {
            NIL => self.head = index,
            tail => self.slab[tail].next = index,
        }

        self.tail = index;
    }
}
