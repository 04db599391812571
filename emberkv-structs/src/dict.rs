//! Chained hash table with incremental rehash.
//!
//! [`Dict`] keeps two internal tables. All entries normally live in table 0;
//! an expansion allocates table 1 and migrates buckets one at a time, paced
//! by foreground operations, so no single insert or lookup ever pays for a
//! full-table copy. Key hashing and equality are pluggable through
//! [`KeyDiscipline`].
//!
//! # Lifecycle
//!
//! 1. **Create**: empty, no buckets allocated; the first insert allocates
//!    table 0 at [`INITIAL_SIZE`].
//! 2. **Grow**: when `used >= size` (and resizing is enabled, or the load
//!    factor passes the force ratio), table 1 is allocated at the smallest
//!    power of two ≥ 2·used and `rehash_idx` starts at 0.
//! 3. **Migrate**: every non-iterating lookup, insert, or delete moves one
//!    bucket from table 0 to table 1; [`Dict::rehash_for`] runs bounded
//!    batches from a maintenance tick.
//! 4. **Finish**: once table 0 is empty it is dropped, table 1 becomes
//!    table 0, and `rehash_idx` returns to −1.
//!
//! # Key invariants
//!
//! - `rehash_idx == -1` iff no rehash is in progress; table 1 is then empty.
//! - While rehashing, buckets `[0, rehash_idx)` of table 0 are all empty.
//! - A key appears at most once across both tables.
//! - While a safe iterator is live, no incremental rehash step runs.
//!
//! # Iteration
//!
//! [`Dict::iter`] borrows the dictionary shared, so mutation during
//! iteration is a compile error; a fingerprint over the table pointers and
//! counters is still taken at construction and asserted on drop.
//! [`Dict::iter_safe`] borrows exclusively, suspends incremental rehash for
//! its lifetime, and supports deleting the entry it just yielded.
//! [`Dict::scan`] is the stateless, mutation-tolerant cursor walk.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::hash::{djb_case, int_mix32, murmur2, DEFAULT_HASH_SEED};

/// Initial table size (buckets); always a power of two.
pub const INITIAL_SIZE: usize = 4;

/// Load factor (`used / size`) past which a grow happens even with
/// resizing disabled.
const FORCE_RESIZE_RATIO: usize = 5;

/// Empty buckets a single rehash step may probe per requested bucket
/// before giving up for this step.
const EMPTY_VISITS_PER_STEP: usize = 10;

/// Buckets migrated per iteration of the time-bounded batch rehash.
const BATCH_STEP_BUCKETS: usize = 100;

// ---------------------------------------------------------------------------
// Key disciplines
// ---------------------------------------------------------------------------

/// Hashing and equality over caller-opaque keys.
///
/// The discipline value is stored in the dictionary and consulted on every
/// hash or comparison, so it may carry state (seed, collation tables, ...).
pub trait KeyDiscipline<K: ?Sized> {
    /// Hash `key` into 32 bits.
    fn hash(&self, key: &K) -> u32;

    /// Key equality under this discipline.
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// Byte-wise keys hashed with seeded MurmurHash2. The default discipline
/// for any key exposing its bytes.
#[derive(Clone, Copy, Debug)]
pub struct BinaryKeys {
    seed: u32,
}

impl BinaryKeys {
    pub fn new() -> Self {
        Self { seed: DEFAULT_HASH_SEED }
    }

    /// Randomizing the seed per instance hardens against collision
    /// flooding of attacker-chosen keys.
    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for BinaryKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AsRef<[u8]>> KeyDiscipline<K> for BinaryKeys {
    #[inline]
    fn hash(&self, key: &K) -> u32 {
        murmur2(key.as_ref(), self.seed)
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a.as_ref() == b.as_ref()
    }
}

/// ASCII-case-insensitive keys (DJB ×33 hash over lowercased bytes).
#[derive(Clone, Copy, Debug)]
pub struct CaseInsensitiveKeys {
    seed: u32,
}

impl CaseInsensitiveKeys {
    pub fn new() -> Self {
        Self { seed: DEFAULT_HASH_SEED }
    }

    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for CaseInsensitiveKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AsRef<[u8]>> KeyDiscipline<K> for CaseInsensitiveKeys {
    #[inline]
    fn hash(&self, key: &K) -> u32 {
        djb_case(key.as_ref(), self.seed)
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a.as_ref().eq_ignore_ascii_case(b.as_ref())
    }
}

/// Integer keys scattered through Thomas Wang's 32-bit mix.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntKeys;

impl KeyDiscipline<u32> for IntKeys {
    #[inline]
    fn hash(&self, key: &u32) -> u32 {
        int_mix32(*key)
    }

    #[inline]
    fn eq(&self, a: &u32, b: &u32) -> bool {
        a == b
    }
}

impl KeyDiscipline<u64> for IntKeys {
    #[inline]
    fn hash(&self, key: &u64) -> u32 {
        // fold the halves so both contribute to the 32-bit mix
        int_mix32((*key ^ (*key >> 32)) as u32)
    }

    #[inline]
    fn eq(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

// ---------------------------------------------------------------------------
// Entries and tables
// ---------------------------------------------------------------------------

type Link<K, V> = Option<Box<Entry<K, V>>>;

struct Entry<K, V> {
    key: K,
    val: V,
    next: Link<K, V>,
}

struct Table<K, V> {
    buckets: Vec<Link<K, V>>,
    used: usize,
}

impl<K, V> Table<K, V> {
    fn empty() -> Self {
        Self { buckets: Vec::new(), used: 0 }
    }

    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Self { buckets, used: 0 }
    }

    #[inline]
    fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket mask; valid only when the table is allocated.
    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len().wrapping_sub(1)
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Unlink chains iteratively; recursive Box drops would overflow
        // the stack on adversarially long chains.
        for bucket in &mut self.buckets {
            let mut entry = bucket.take();
            while let Some(mut e) = entry {
                entry = e.next.take();
            }
        }
    }
}

/// Length of a bucket chain.
fn chain_len<K, V>(mut link: &Link<K, V>) -> usize {
    let mut n = 0;
    while let Some(e) = link {
        n += 1;
        link = &e.next;
    }
    n
}

/// First entry in the chain matching `pred`, mutably.
fn chain_find_mut<'a, K, V>(
    link: &'a mut Link<K, V>,
    mut pred: impl FnMut(&K) -> bool,
) -> Option<&'a mut Entry<K, V>> {
    let mut cur = link.as_deref_mut();
    while let Some(e) = cur {
        if pred(&e.key) {
            return Some(e);
        }
        cur = e.next.as_deref_mut();
    }
    None
}

/// Unlink and return the first entry in the chain matching `pred`.
fn chain_remove<K, V>(
    link: &mut Link<K, V>,
    mut pred: impl FnMut(&K) -> bool,
) -> Option<Box<Entry<K, V>>> {
    let mut cur = link;
    loop {
        let found = match cur.as_deref() {
            None => return None,
            Some(e) => pred(&e.key),
        };
        if found {
            let mut e = cur.take()?;
            *cur = e.next.take();
            return Some(e);
        }
        match cur {
            Some(e) => cur = &mut e.next,
            None => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dict
// ---------------------------------------------------------------------------

/// Chained hash table over two tables with incremental rehash.
pub struct Dict<K, V, D: KeyDiscipline<K>> {
    tables: [Table<K, V>; 2],
    /// Next table-0 bucket to migrate; −1 when no rehash is in progress.
    rehash_idx: isize,
    /// Live safe iterators; incremental rehash is suspended while nonzero.
    iterators: usize,
    can_resize: bool,
    discipline: D,
}

impl<K, V, D: KeyDiscipline<K> + Default> Dict<K, V, D> {
    /// Create an empty dictionary with the default-constructed discipline.
    pub fn new() -> Self {
        Self::with_discipline(D::default())
    }
}

impl<K, V, D: KeyDiscipline<K> + Default> Default for Dict<K, V, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, D: KeyDiscipline<K>> Dict<K, V, D> {
    /// Create an empty dictionary with an explicit discipline value.
    pub fn with_discipline(discipline: D) -> Self {
        Self {
            tables: [Table::empty(), Table::empty()],
            rehash_idx: -1,
            iterators: 0,
            can_resize: true,
            discipline,
        }
    }

    /// Number of stored entries across both tables.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    /// True if no entries are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total allocated buckets across both tables.
    #[inline]
    pub fn slots(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    /// True while entries are being migrated between the two tables.
    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// The next table-0 bucket to migrate, while rehashing.
    #[inline]
    pub fn rehash_index(&self) -> Option<usize> {
        if self.rehash_idx >= 0 {
            Some(self.rehash_idx as usize)
        } else {
            None
        }
    }

    /// Enable or disable automatic growth at the 1:1 load factor. Growth
    /// still happens past the force ratio regardless.
    pub fn set_resize_enabled(&mut self, enabled: bool) {
        self.can_resize = enabled;
    }

    // -- sizing -------------------------------------------------------------

    /// Install a table of the smallest power of two ≥ `size`.
    ///
    /// Returns `false` (and changes nothing) when a rehash is in progress,
    /// `size` cannot hold the current entries, or the size is unchanged.
    /// On a fresh dictionary this is a plain first allocation; otherwise
    /// the new table becomes the rehash target.
    pub fn expand(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.tables[0].used > size {
            return false;
        }
        let realsize = next_power(size);
        if realsize == self.tables[0].size() {
            return false;
        }
        let table = Table::with_size(realsize);
        if self.tables[0].size() == 0 {
            self.tables[0] = table;
            return true;
        }
        self.tables[1] = table;
        self.rehash_idx = 0;
        true
    }

    /// Shrink to the smallest power of two holding the current entries.
    ///
    /// Rejected while resizing is disabled or a rehash is in progress.
    pub fn try_resize(&mut self) -> bool {
        if !self.can_resize || self.is_rehashing() {
            return false;
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            self.expand(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (self.can_resize || used / size > FORCE_RESIZE_RATIO) {
            self.expand(used * 2);
        }
    }

    // -- rehashing ----------------------------------------------------------

    /// Migrate up to `n` non-empty buckets from table 0 to table 1,
    /// probing at most `10·n` empty buckets. Returns `true` while entries
    /// remain to migrate.
    pub fn rehash_step(&mut self, n: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        let mut empty_visits = n * EMPTY_VISITS_PER_STEP;
        let mut n = n;
        while n > 0 && self.tables[0].used != 0 {
            n -= 1;
            // rehash_idx stays in range: table 0 still holds entries
            assert!(
                (self.rehash_idx as usize) < self.tables[0].size(),
                "rehash_idx ran past table 0"
            );
            while self.tables[0].buckets[self.rehash_idx as usize].is_none() {
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            // splice the whole chain into table 1, head-first
            let idx = self.rehash_idx as usize;
            let mut entry = self.tables[0].buckets[idx].take();
            while let Some(mut e) = entry {
                entry = e.next.take();
                let h = self.discipline.hash(&e.key) as usize & self.tables[1].mask();
                e.next = self.tables[1].buckets[h].take();
                self.tables[1].buckets[h] = Some(e);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_idx += 1;
        }

        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::replace(&mut self.tables[1], Table::empty());
            self.rehash_idx = -1;
            return false;
        }
        true
    }

    /// Run 100-bucket rehash steps until `budget` elapses or migration
    /// completes. Returns the number of step batches attempted ×100.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        let start = Instant::now();
        let mut buckets = 0;
        while self.rehash_step(BATCH_STEP_BUCKETS) {
            buckets += BATCH_STEP_BUCKETS;
            if start.elapsed() > budget {
                break;
            }
        }
        buckets
    }

    /// One opportunistic rehash step, skipped while safe iterators are
    /// outstanding.
    fn step_rehash(&mut self) {
        if self.iterators == 0 && self.is_rehashing() {
            self.rehash_step(1);
        }
    }

    // -- lookup -------------------------------------------------------------

    /// Look up `key`, advancing the rehash by one step first.
    pub fn find(&mut self, key: &K) -> Option<&V> {
        if self.tables[0].size() == 0 {
            return None;
        }
        self.step_rehash();
        self.entry(key).map(|e| &e.val)
    }

    /// Mutable lookup, advancing the rehash by one step first.
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.tables[0].size() == 0 {
            return None;
        }
        self.step_rehash();
        self.entry_mut(key).map(|e| &mut e.val)
    }

    /// Read-only lookup that never touches the rehash state.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entry(key).map(|e| &e.val)
    }

    /// Mutable lookup that never touches the rehash state.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entry_mut(key).map(|e| &mut e.val)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entry(key).is_some()
    }

    fn entry(&self, key: &K) -> Option<&Entry<K, V>> {
        if self.tables[0].size() == 0 {
            return None;
        }
        let h = self.discipline.hash(key) as usize;
        for table in &self.tables {
            if table.size() == 0 {
                break;
            }
            let idx = h & table.mask();
            let mut cur = table.buckets[idx].as_deref();
            while let Some(e) = cur {
                if self.discipline.eq(key, &e.key) {
                    return Some(e);
                }
                cur = e.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    fn entry_mut(&mut self, key: &K) -> Option<&mut Entry<K, V>> {
        if self.tables[0].size() == 0 {
            return None;
        }
        let h = self.discipline.hash(key) as usize;
        let rehashing = self.rehash_idx != -1;
        let disc = &self.discipline;
        let [t0, t1] = &mut self.tables;

        let i0 = h & (t0.buckets.len() - 1);
        if let Some(e) = chain_find_mut(&mut t0.buckets[i0], |k| disc.eq(key, k)) {
            return Some(e);
        }
        if !rehashing {
            return None;
        }
        let i1 = h & (t1.buckets.len() - 1);
        chain_find_mut(&mut t1.buckets[i1], |k| disc.eq(key, k))
    }

    // -- insertion ----------------------------------------------------------

    /// Insert a new entry. A duplicate key is a soft failure returning the
    /// rejected pair to the caller.
    pub fn add(&mut self, key: K, val: V) -> Result<(), (K, V)> {
        match self.add_raw(key, val) {
            Ok(_) => Ok(()),
            Err(pair) => Err(pair),
        }
    }

    /// Insert or overwrite. Returns `true` when the key was fresh. The new
    /// value is installed before the old one is dropped, so values holding
    /// shared handles survive a self-replace.
    pub fn replace(&mut self, key: K, val: V) -> bool {
        match self.add_raw(key, val) {
            Ok(_) => true,
            Err((key, val)) => {
                let entry = match self.entry_mut(&key) {
                    Some(e) => e,
                    None => unreachable!("duplicate reported for an absent key"),
                };
                let old = std::mem::replace(&mut entry.val, val);
                drop(old);
                false
            }
        }
    }

    /// Value for `key`, inserting `default()` first when absent.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        if !self.contains_key(&key) {
            let (t, idx) = match self.add_raw(key, default()) {
                Ok(loc) => loc,
                Err(_) => unreachable!("key reported absent"),
            };
            return match self.tables[t].buckets[idx].as_deref_mut() {
                Some(e) => &mut e.val,
                None => unreachable!("freshly filled bucket is non-empty"),
            };
        }
        match self.entry_mut(&key) {
            Some(e) => &mut e.val,
            None => unreachable!("key reported present"),
        }
    }

    /// Insert at the head of its bucket; returns `(table, bucket)` of the
    /// new entry, or the rejected pair on duplicate.
    fn add_raw(&mut self, key: K, val: V) -> Result<(usize, usize), (K, V)> {
        self.step_rehash();
        let Some(idx) = self.key_index(&key) else {
            return Err((key, val));
        };
        let ti = usize::from(self.is_rehashing());
        let table = &mut self.tables[ti];
        let entry = Box::new(Entry { key, val, next: table.buckets[idx].take() });
        table.buckets[idx] = Some(entry);
        table.used += 1;
        Ok((ti, idx))
    }

    /// Bucket index for inserting `key`, in table 1 while rehashing and
    /// table 0 otherwise; `None` when the key already exists. Runs the
    /// growth check first.
    fn key_index(&mut self, key: &K) -> Option<usize> {
        self.expand_if_needed();
        let h = self.discipline.hash(key) as usize;
        let mut idx = 0;
        for table in &self.tables {
            idx = h & table.mask();
            let mut cur = table.buckets[idx].as_deref();
            while let Some(e) = cur {
                if self.discipline.eq(key, &e.key) {
                    return None;
                }
                cur = e.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        Some(idx)
    }

    // -- deletion -----------------------------------------------------------

    /// Remove `key`, returning its value. The key itself is dropped.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_entry(key).map(|(_, v)| v)
    }

    /// Remove `key`, handing both the stored key and value back to the
    /// caller.
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        if self.tables[0].size() == 0 {
            return None;
        }
        self.step_rehash();
        let h = self.discipline.hash(key) as usize;
        let rehashing = self.rehash_idx != -1;
        let disc = &self.discipline;
        let [t0, t1] = &mut self.tables;

        let i0 = h & (t0.buckets.len() - 1);
        if let Some(e) = chain_remove(&mut t0.buckets[i0], |k| disc.eq(key, k)) {
            t0.used -= 1;
            let entry = *e;
            return Some((entry.key, entry.val));
        }
        if !rehashing {
            return None;
        }
        let i1 = h & (t1.buckets.len() - 1);
        let e = chain_remove(&mut t1.buckets[i1], |k| disc.eq(key, k))?;
        t1.used -= 1;
        let entry = *e;
        Some((entry.key, entry.val))
    }

    /// Drop every entry and release both tables.
    pub fn clear(&mut self) {
        self.tables = [Table::empty(), Table::empty()];
        self.rehash_idx = -1;
    }

    // -- fingerprint --------------------------------------------------------

    /// A 64-bit digest of the dictionary state: both tables' bucket
    /// pointers, sizes, and counts folded through Tomas Wang's 64-bit
    /// integer hash. Any mutation changes it with overwhelming
    /// probability.
    fn fingerprint(&self) -> u64 {
        let fields = [
            self.tables[0].buckets.as_ptr() as u64,
            self.tables[0].size() as u64,
            self.tables[0].used as u64,
            self.tables[1].buckets.as_ptr() as u64,
            self.tables[1].size() as u64,
            self.tables[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for n in fields {
            hash = hash.wrapping_add(n);
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    // -- iteration ----------------------------------------------------------

    /// Iterate entries across table 0 and, while rehashing, table 1.
    ///
    /// Holds a shared borrow for its whole lifetime, so the dictionary
    /// cannot be mutated (and no rehash step runs) until the iterator is
    /// dropped; the drop re-checks the construction-time fingerprint.
    pub fn iter(&self) -> Iter<'_, K, V, D> {
        Iter {
            dict: self,
            table: 0,
            index: -1,
            entry: None,
            fingerprint: self.fingerprint(),
        }
    }

    /// Exclusive iterator that suspends incremental rehash and tolerates
    /// deletion of the entry it just yielded (see
    /// [`SafeIter::remove_current`]).
    pub fn iter_safe(&mut self) -> SafeIter<'_, K, V, D> {
        self.iterators += 1;
        SafeIter {
            dict: self,
            table: 0,
            index: 0,
            pos: 0,
            current: None,
        }
    }

    // -- cursor scan --------------------------------------------------------

    /// Visit the bucket(s) selected by `cursor` and return the next cursor.
    ///
    /// Start with cursor 0 and call repeatedly with each returned value; a
    /// returned 0 means the pass is complete. Every entry present from
    /// start to end of the pass is visited at least once; entries may be
    /// visited more than once across a resize, and concurrent insertions
    /// or deletions between calls may or may not be seen.
    ///
    /// The cursor advances by reverse-bit increment: high bits move first,
    /// which keeps already-visited bucket families stable across table
    /// growth and shrink.
    pub fn scan<F: FnMut(&K, &V)>(&self, cursor: u64, mut visit: F) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;
        let m0;

        if !self.is_rehashing() {
            let t0 = &self.tables[0];
            m0 = t0.mask() as u64;
            emit_chain(&t0.buckets[(v & m0) as usize], &mut visit);
        } else {
            let (mut t0, mut t1) = (&self.tables[0], &self.tables[1]);
            // iterate the smaller table first, then all expansions of the
            // cursor inside the larger one
            if t0.size() > t1.size() {
                std::mem::swap(&mut t0, &mut t1);
            }
            m0 = t0.mask() as u64;
            let m1 = t1.mask() as u64;

            emit_chain(&t0.buckets[(v & m0) as usize], &mut visit);
            loop {
                emit_chain(&t1.buckets[(v & m1) as usize], &mut visit);
                // increment only the bits above the smaller mask
                v = (((v | m0).wrapping_add(1)) & !m0) | (v & m0);
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }

        // force the unmasked bits high so the reversed increment carries
        // through the masked bits only
        v |= !m0;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v.reverse_bits()
    }

    // -- sampling -----------------------------------------------------------

    /// A uniformly random entry: uniform over non-empty buckets, then
    /// uniform within the chosen chain.
    pub fn random_entry<R: Rng>(&mut self, rng: &mut R) -> Option<(&K, &V)> {
        if self.is_empty() {
            return None;
        }
        self.step_rehash();

        let (t, idx) = if self.is_rehashing() {
            loop {
                // buckets below rehash_idx in table 0 are guaranteed empty
                let ridx = self.rehash_idx as usize;
                let total = self.tables[0].size() + self.tables[1].size();
                let h = ridx + rng.gen_range(0..total - ridx);
                let (t, i) = if h >= self.tables[0].size() {
                    (1, h - self.tables[0].size())
                } else {
                    (0, h)
                };
                if self.tables[t].buckets[i].is_some() {
                    break (t, i);
                }
            }
        } else {
            loop {
                let i = rng.gen_range(0..self.tables[0].size());
                if self.tables[0].buckets[i].is_some() {
                    break (0, i);
                }
            }
        };

        let chain = &self.tables[t].buckets[idx];
        let target = rng.gen_range(0..chain_len(chain));
        let mut cur = chain.as_deref();
        for _ in 0..target {
            cur = cur.and_then(|e| e.next.as_deref());
        }
        cur.map(|e| (&e.key, &e.val))
    }

    /// Scatter-sample up to `count` entries from random locations.
    ///
    /// Faster than `count` independent [`Self::random_entry`] calls but
    /// with no distribution guarantee: runs of chained entries are taken
    /// together, a fresh random start is picked after `max(5, count)`
    /// consecutive empty buckets, and the walk gives up after `10·count`
    /// steps, so fewer than `count` entries may come back.
    pub fn sample<R: Rng>(&mut self, rng: &mut R, count: usize) -> Vec<(&K, &V)> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }
        let mut maxsteps = count * 10;

        // pay rehash work proportional to the sample size up front
        for _ in 0..count {
            if self.is_rehashing() {
                self.step_rehash();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxsizemask = self.tables[0].mask();
        if tables > 1 && maxsizemask < self.tables[1].mask() {
            maxsizemask = self.tables[1].mask();
        }

        let mut i = rng.gen_range(0..=maxsizemask);
        let mut emptylen = 0;
        let mut out: Vec<(&K, &V)> = Vec::with_capacity(count);
        while out.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for j in 0..tables {
                // no bucket below rehash_idx in table 0 is populated
                if tables == 2 && j == 0 && i < self.rehash_idx as usize {
                    // out of range for the (smaller) new table as well:
                    // nothing below rehash_idx anywhere, skip ahead
                    if i >= self.tables[1].size() {
                        i = self.rehash_idx as usize;
                    }
                    continue;
                }
                if i >= self.tables[j].size() {
                    continue;
                }
                match self.tables[j].buckets[i].as_deref() {
                    None => {
                        emptylen += 1;
                        if emptylen >= 5 && emptylen > count {
                            i = rng.gen_range(0..=maxsizemask);
                            emptylen = 0;
                        }
                    }
                    Some(head) => {
                        emptylen = 0;
                        let mut cur = Some(head);
                        while let Some(e) = cur {
                            out.push((&e.key, &e.val));
                            if out.len() == count {
                                return out;
                            }
                            cur = e.next.as_deref();
                        }
                    }
                }
            }
            i = (i + 1) & maxsizemask;
        }
        out
    }
}

/// Smallest power of two ≥ `size`, floored at [`INITIAL_SIZE`].
fn next_power(size: usize) -> usize {
    size.next_power_of_two().max(INITIAL_SIZE)
}

fn emit_chain<K, V, F: FnMut(&K, &V)>(link: &Link<K, V>, visit: &mut F) {
    let mut cur = link.as_deref();
    while let Some(e) = cur {
        visit(&e.key, &e.val);
        cur = e.next.as_deref();
    }
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// Shared-borrow iterator over `(&K, &V)`.
///
/// Mutation of the dictionary while this iterator is alive is a compile
/// error; the state fingerprint is re-checked on drop regardless.
pub struct Iter<'a, K, V, D: KeyDiscipline<K>> {
    dict: &'a Dict<K, V, D>,
    table: usize,
    index: isize,
    entry: Option<&'a Entry<K, V>>,
    fingerprint: u64,
}

impl<'a, K, V, D: KeyDiscipline<K>> Iterator for Iter<'a, K, V, D> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entry {
                Some(e) => {
                    self.entry = e.next.as_deref();
                    return Some((&e.key, &e.val));
                }
                None => {
                    self.index += 1;
                    let ht = &self.dict.tables[self.table];
                    if self.index as usize >= ht.size() {
                        if self.dict.is_rehashing() && self.table == 0 {
                            self.table = 1;
                            self.index = 0;
                        } else {
                            return None;
                        }
                    }
                    let ht = &self.dict.tables[self.table];
                    if (self.index as usize) < ht.size() {
                        self.entry = ht.buckets[self.index as usize].as_deref();
                    }
                }
            }
        }
    }
}

impl<K, V, D: KeyDiscipline<K>> Drop for Iter<'_, K, V, D> {
    fn drop(&mut self) {
        assert!(
            self.fingerprint == self.dict.fingerprint(),
            "dictionary mutated during iteration"
        );
    }
}

/// Exclusive lending iterator that pauses incremental rehash.
///
/// Yields `(&K, &mut V)` through [`Self::next`]; the entry most recently
/// yielded may be deleted with [`Self::remove_current`] without upsetting
/// the traversal.
pub struct SafeIter<'a, K, V, D: KeyDiscipline<K>> {
    dict: &'a mut Dict<K, V, D>,
    table: usize,
    index: usize,
    /// Chain position of the entry to yield next within the current bucket.
    pos: usize,
    /// Location of the most recently yielded entry.
    current: Option<(usize, usize, usize)>,
}

impl<K, V, D: KeyDiscipline<K>> SafeIter<'_, K, V, D> {
    /// The next entry, or `None` when the traversal is finished.
    pub fn next(&mut self) -> Option<(&K, &mut V)> {
        loop {
            let size = self.dict.tables[self.table].size();
            if self.index >= size {
                if self.dict.is_rehashing() && self.table == 0 {
                    self.table = 1;
                    self.index = 0;
                    self.pos = 0;
                    continue;
                }
                return None;
            }
            let len = chain_len(&self.dict.tables[self.table].buckets[self.index]);
            if self.pos >= len {
                self.index += 1;
                self.pos = 0;
                continue;
            }
            break;
        }

        let (t, i, p) = (self.table, self.index, self.pos);
        self.current = Some((t, i, p));
        self.pos += 1;

        let mut cur = self.dict.tables[t].buckets[i].as_deref_mut();
        for _ in 0..p {
            cur = match cur {
                Some(e) => e.next.as_deref_mut(),
                None => None,
            };
        }
        cur.map(|e| (&e.key, &mut e.val))
    }

    /// Unlink the entry most recently yielded by [`Self::next`] and hand
    /// it back. The traversal continues with the entry after it.
    pub fn remove_current(&mut self) -> Option<(K, V)> {
        let (t, i, p) = self.current.take()?;
        let mut link = &mut self.dict.tables[t].buckets[i];
        for _ in 0..p {
            link = match link {
                Some(e) => &mut e.next,
                None => return None,
            };
        }
        let mut e = link.take()?;
        *link = e.next.take();
        self.dict.tables[t].used -= 1;
        // the successor slid into the vacated chain position
        self.pos = p;
        let entry = *e;
        Some((entry.key, entry.val))
    }
}

impl<K, V, D: KeyDiscipline<K>> Drop for SafeIter<'_, K, V, D> {
    fn drop(&mut self) {
        self.dict.iterators -= 1;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    type StrDict = Dict<String, u64, BinaryKeys>;

    fn key(i: u64) -> String {
        format!("key:{i}")
    }

    /// Structural invariants that must hold after any operation sequence.
    fn check_invariants(d: &StrDict) {
        // used matches the chains actually present
        for t in &d.tables {
            let total: usize = t.buckets.iter().map(chain_len).sum();
            assert_eq!(total, t.used, "used count drifted from chain lengths");
        }
        // while rehashing, the migrated prefix of table 0 is empty
        if let Some(ridx) = d.rehash_index() {
            for bucket in &d.tables[0].buckets[..ridx] {
                assert!(bucket.is_none(), "populated bucket below rehash_idx");
            }
        } else {
            assert_eq!(d.tables[1].size(), 0, "table 1 allocated while idle");
        }
        // no key twice within or across tables
        let mut seen = HashSet::new();
        for t in &d.tables {
            for bucket in &t.buckets {
                let mut cur = bucket.as_deref();
                while let Some(e) = cur {
                    assert!(seen.insert(e.key.clone()), "duplicate key {}", e.key);
                    cur = e.next.as_deref();
                }
            }
        }
        assert_eq!(seen.len(), d.len());
    }

    // --- Insert / lookup / delete ---

    #[test]
    fn test_add_and_find() {
        let mut d = StrDict::new();
        assert!(d.add(key(1), 100).is_ok());
        assert!(d.add(key(2), 200).is_ok());
        assert_eq!(d.find(&key(1)), Some(&100));
        assert_eq!(d.find(&key(2)), Some(&200));
        assert_eq!(d.find(&key(3)), None);
        assert_eq!(d.len(), 2);
        check_invariants(&d);
    }

    #[test]
    fn test_duplicate_add_is_soft_failure() {
        let mut d = StrDict::new();
        assert!(d.add(key(1), 1).is_ok());
        let rejected = d.add(key(1), 2);
        assert_eq!(rejected, Err((key(1), 2)));
        assert_eq!(d.get(&key(1)), Some(&1));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_replace() {
        let mut d = StrDict::new();
        assert!(d.replace(key(1), 1));
        assert!(!d.replace(key(1), 2));
        assert_eq!(d.get(&key(1)), Some(&2));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut d = StrDict::new();
        assert_eq!(*d.get_or_insert_with(key(1), || 7), 7);
        *d.get_or_insert_with(key(1), || 99) += 1;
        assert_eq!(d.get(&key(1)), Some(&8));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_remove_and_remove_entry() {
        let mut d = StrDict::new();
        d.add(key(1), 10).unwrap();
        d.add(key(2), 20).unwrap();
        assert_eq!(d.remove(&key(1)), Some(10));
        assert_eq!(d.remove(&key(1)), None);
        assert_eq!(d.remove_entry(&key(2)), Some((key(2), 20)));
        assert!(d.is_empty());
        check_invariants(&d);
    }

    #[test]
    fn test_find_on_fresh_dict() {
        let mut d = StrDict::new();
        assert_eq!(d.find(&key(1)), None);
        assert_eq!(d.remove(&key(1)), None);
    }

    #[test]
    fn test_random_keys_distinctness() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut d = StrDict::new();
        let mut inserted = HashSet::new();
        for _ in 0..1024 {
            let k = rng.gen_range(0..2048u64);
            if d.add(key(k), k).is_ok() {
                inserted.insert(k);
            }
        }
        assert_eq!(d.len(), inserted.len());
        for &k in &inserted {
            assert_eq!(d.find(&key(k)), Some(&k));
        }
        check_invariants(&d);
    }

    // --- Sizing and rehash ---

    #[test]
    fn test_initial_allocation_is_lazy() {
        let d = StrDict::new();
        assert_eq!(d.slots(), 0);
        let mut d = d;
        d.add(key(1), 1).unwrap();
        assert_eq!(d.slots(), INITIAL_SIZE);
    }

    #[test]
    fn test_grow_starts_incremental_rehash() {
        let mut d = StrDict::new();
        // fill to the 1:1 load factor, then one more insert forces a grow
        for i in 0..5u64 {
            d.add(key(i), i).unwrap();
        }
        assert!(d.is_rehashing());
        check_invariants(&d);

        // lookups keep working and drive migration to completion
        let mut steps = 0;
        while d.is_rehashing() {
            assert_eq!(d.find(&key(0)), Some(&0));
            steps += 1;
            assert!(steps <= d.slots() * 2, "rehash failed to converge");
        }
        assert_eq!(d.rehash_index(), None);
        for i in 0..5u64 {
            assert_eq!(d.find(&key(i)), Some(&i));
        }
        check_invariants(&d);
    }

    #[test]
    fn test_rehash_prefix_invariant_holds_midway() {
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        assert!(d.is_rehashing());
        while d.is_rehashing() {
            d.rehash_step(1);
            check_invariants(&d);
        }
    }

    #[test]
    fn test_expand_rejected_while_rehashing_or_too_small() {
        let mut d = StrDict::new();
        for i in 0..8u64 {
            d.add(key(i), i).unwrap();
        }
        d.expand(64);
        assert!(d.is_rehashing());
        assert!(!d.expand(128), "expand must be rejected mid-rehash");
        while d.rehash_step(8) {}
        assert!(!d.expand(4), "expand below used must be rejected");
    }

    #[test]
    fn test_rehash_for_with_budget() {
        let mut d = StrDict::new();
        for i in 0..2000u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        d.rehash_for(Duration::from_millis(50));
        // a generous budget finishes the migration outright
        assert!(!d.is_rehashing());
        check_invariants(&d);
    }

    #[test]
    fn test_force_ratio_grow_with_resize_disabled() {
        let mut d = StrDict::new();
        d.set_resize_enabled(false);
        // load factor must exceed FORCE_RESIZE_RATIO before a grow happens
        for i in 0..=INITIAL_SIZE as u64 * 6 {
            d.add(key(i), i).unwrap();
        }
        assert!(d.is_rehashing() || d.slots() > INITIAL_SIZE);
        check_invariants(&d);
    }

    #[test]
    fn test_try_resize_shrinks() {
        let mut d = StrDict::new();
        for i in 0..256u64 {
            d.add(key(i), i).unwrap();
        }
        while d.is_rehashing() {
            d.rehash_step(16);
        }
        for i in 8..256u64 {
            d.remove(&key(i));
        }
        let before = d.slots();
        assert!(d.try_resize());
        while d.is_rehashing() {
            d.rehash_step(16);
        }
        assert!(d.slots() < before);
        for i in 0..8u64 {
            assert_eq!(d.get(&key(i)), Some(&i));
        }
        check_invariants(&d);
    }

    #[test]
    fn test_clear() {
        let mut d = StrDict::new();
        for i in 0..100u64 {
            d.add(key(i), i).unwrap();
        }
        d.clear();
        assert!(d.is_empty());
        assert_eq!(d.slots(), 0);
        assert!(!d.is_rehashing());
        d.add(key(1), 1).unwrap();
        assert_eq!(d.len(), 1);
    }

    // --- Iteration ---

    #[test]
    fn test_iter_visits_every_entry() {
        let mut d = StrDict::new();
        for i in 0..100u64 {
            d.add(key(i), i).unwrap();
        }
        let visited: HashSet<String> = d.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(visited.len(), 100);
    }

    #[test]
    fn test_iter_spans_both_tables_during_rehash() {
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        d.rehash_step(3);
        assert!(d.is_rehashing());
        assert_eq!(d.iter().count(), 64);
    }

    #[test]
    fn test_fingerprint_stable_across_iteration_and_sensitive_to_change() {
        let mut d = StrDict::new();
        for i in 0..32u64 {
            d.add(key(i), i).unwrap();
        }
        let before = d.fingerprint();
        let n = d.iter().count();
        assert_eq!(n, 32);
        assert_eq!(d.fingerprint(), before);

        d.add(key(999), 999).unwrap();
        assert_ne!(d.fingerprint(), before);

        let with_extra = d.fingerprint();
        d.remove(&key(999));
        assert_ne!(d.fingerprint(), with_extra);
    }

    #[test]
    fn test_safe_iter_yields_all_and_mutates_values() {
        let mut d = StrDict::new();
        for i in 0..50u64 {
            d.add(key(i), i).unwrap();
        }
        let mut n = 0;
        let mut it = d.iter_safe();
        while let Some((_, v)) = it.next() {
            *v += 1;
            n += 1;
        }
        drop(it);
        assert_eq!(n, 50);
        for i in 0..50u64 {
            assert_eq!(d.get(&key(i)), Some(&(i + 1)));
        }
    }

    #[test]
    fn test_safe_iter_remove_all() {
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        let mut removed = 0;
        let mut it = d.iter_safe();
        while it.next().is_some() {
            assert!(it.remove_current().is_some());
            removed += 1;
        }
        drop(it);
        assert_eq!(removed, 64);
        assert!(d.is_empty());
        check_invariants(&d);
    }

    #[test]
    fn test_safe_iter_remove_every_other() {
        let mut d = StrDict::new();
        for i in 0..100u64 {
            d.add(key(i), i).unwrap();
        }
        let mut it = d.iter_safe();
        while let Some((_, v)) = it.next() {
            if *v % 2 == 0 {
                it.remove_current();
            }
        }
        drop(it);
        assert_eq!(d.len(), 50);
        for i in 0..100u64 {
            assert_eq!(d.get(&key(i)).is_some(), i % 2 == 1);
        }
        check_invariants(&d);
    }

    #[test]
    fn test_safe_iter_suspends_rehash() {
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        let ridx_before = d.rehash_index();
        let mut it = d.iter_safe();
        while it.next().is_some() {}
        drop(it);
        // iteration alone must not have advanced the migration
        assert_eq!(d.rehash_index(), ridx_before);
    }

    // --- Scan ---

    fn scan_all(d: &StrDict) -> Vec<String> {
        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| seen.push(k.clone()));
            if cursor == 0 {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_scan_covers_all_keys() {
        let mut d = StrDict::new();
        for i in 0..500u64 {
            d.add(key(i), i).unwrap();
        }
        let seen: HashSet<String> = scan_all(&d).into_iter().collect();
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn test_scan_covers_all_keys_while_rehashing() {
        let mut d = StrDict::new();
        for i in 0..128u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        d.rehash_step(2);
        assert!(d.is_rehashing());
        let seen: HashSet<String> = scan_all(&d).into_iter().collect();
        assert_eq!(seen.len(), 128, "scan must cover both tables");
    }

    #[test]
    fn test_scan_coverage_across_midscan_grow() {
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        while d.is_rehashing() {
            d.rehash_step(16);
        }
        let stable: HashSet<String> = (0..64).map(key).collect();

        let mut seen = HashSet::new();
        let mut cursor = d.scan(0, |k, _| {
            seen.insert(k.clone());
        });
        // grow mid-scan: the reverse cursor stays valid across the resize
        for i in 64..512u64 {
            d.add(key(i), i).unwrap();
        }
        while cursor != 0 {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.clone());
            });
        }
        for k in &stable {
            assert!(seen.contains(k), "missing stable key {k}");
        }
    }

    #[test]
    fn test_scan_coverage_across_midscan_shrink() {
        let mut d = StrDict::new();
        for i in 0..512u64 {
            d.add(key(i), i).unwrap();
        }
        while d.is_rehashing() {
            d.rehash_step(64);
        }

        let mut seen = HashSet::new();
        let mut cursor = d.scan(0, |k, _| {
            seen.insert(k.clone());
        });
        // delete most entries and shrink, mid-scan
        for i in 64..512u64 {
            d.remove(&key(i));
        }
        assert!(d.try_resize());
        while cursor != 0 {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.clone());
            });
        }
        // keys present for the whole pass must all have been seen
        for i in 0..64u64 {
            assert!(seen.contains(&key(i)), "missing stable key {}", key(i));
        }
    }

    // --- Sampling ---

    #[test]
    fn test_random_entry_members_only() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut d = StrDict::new();
        assert!(d.random_entry(&mut rng).is_none());
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        for _ in 0..100 {
            let (k, v) = d.random_entry(&mut rng).unwrap();
            assert_eq!(k, &key(*v));
        }
    }

    #[test]
    fn test_random_entry_while_rehashing() {
        let mut rng = SmallRng::seed_from_u64(6);
        let mut d = StrDict::new();
        for i in 0..64u64 {
            d.add(key(i), i).unwrap();
        }
        if !d.is_rehashing() {
            d.expand(d.len() * 2);
        }
        for _ in 0..100 {
            let (k, v) = d.random_entry(&mut rng).unwrap();
            assert_eq!(k, &key(*v));
        }
    }

    #[test]
    fn test_sample_bounds_and_membership() {
        let mut rng = SmallRng::seed_from_u64(9);
        let mut d = StrDict::new();
        for i in 0..128u64 {
            d.add(key(i), i).unwrap();
        }
        let sampled = d.sample(&mut rng, 16);
        assert!(sampled.len() <= 16);
        for (k, v) in &sampled {
            assert_eq!(*k, &key(**v));
        }
        // asking for more than the population caps at the population
        let sampled = d.sample(&mut rng, 10_000);
        assert!(sampled.len() <= 128);
    }

    #[test]
    fn test_sample_empty_dict() {
        let mut rng = SmallRng::seed_from_u64(10);
        let mut d = StrDict::new();
        assert!(d.sample(&mut rng, 8).is_empty());
    }

    // --- Disciplines ---

    #[test]
    fn test_case_insensitive_discipline() {
        let mut d: Dict<String, u32, CaseInsensitiveKeys> = Dict::new();
        d.add("Content-Length".to_string(), 1).unwrap();
        assert_eq!(d.get(&"content-length".to_string()), Some(&1));
        assert_eq!(d.get(&"CONTENT-LENGTH".to_string()), Some(&1));
        assert!(d.add("CONTENT-length".to_string(), 2).is_err());
    }

    #[test]
    fn test_int_keys_discipline() {
        let mut d: Dict<u64, &str, IntKeys> = Dict::new();
        for i in 0..512u64 {
            d.add(i, "v").unwrap();
        }
        assert_eq!(d.len(), 512);
        assert_eq!(d.get(&100), Some(&"v"));
        assert_eq!(d.get(&1000), None);
    }

    #[test]
    fn test_seeded_discipline_changes_layout_not_semantics() {
        let mut a: StrDict = Dict::with_discipline(BinaryKeys::with_seed(1));
        let mut b: StrDict = Dict::with_discipline(BinaryKeys::with_seed(2));
        for i in 0..64u64 {
            a.add(key(i), i).unwrap();
            b.add(key(i), i).unwrap();
        }
        for i in 0..64u64 {
            assert_eq!(a.get(&key(i)), b.get(&key(i)));
        }
    }

    // --- Stress ---

    #[test]
    fn test_stress_mixed_operations() {
        let mut rng = SmallRng::seed_from_u64(123);
        let mut d = StrDict::new();
        let mut model: std::collections::HashMap<String, u64> = Default::default();
        for _ in 0..20_000 {
            let k = key(rng.gen_range(0..512));
            match rng.gen_range(0..4) {
                0 => {
                    let v = rng.gen();
                    if d.add(k.clone(), v).is_ok() {
                        assert!(model.insert(k, v).is_none());
                    } else {
                        assert!(model.contains_key(&k));
                    }
                }
                1 => {
                    let v = rng.gen();
                    d.replace(k.clone(), v);
                    model.insert(k, v);
                }
                2 => {
                    assert_eq!(d.remove(&k), model.remove(&k));
                }
                _ => {
                    assert_eq!(d.find(&k), model.get(&k));
                }
            }
            assert_eq!(d.len(), model.len());
        }
        check_invariants(&d);
    }
}
