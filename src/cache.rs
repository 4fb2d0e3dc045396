use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

use crate::config::MAX_CACHE_MOVES;
use crate::encoder::{dequantize_probability, quantize_probability, PRIOR_QUANTUM_ONE};

const MAX_TABLE_COUNT: usize = 1 << 8;
const MAX_CHUNKS_PER_TABLE: usize = 1 << 20;
const ENTRIES_PER_CHUNK: usize = 8;

/// Probes summing the quantized priors accept at most this much deviation
/// from one; larger drift means a collision or a torn write.
const GUARD_ALLOWANCE: i64 = 120;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("prediction cache size must be a power-of-two GiB or zero, got {0}")]
    NotPowerOfTwo(u64),
    #[error("maximum prediction cache size is 256 GiB, got {0}")]
    TooLarge(u64),
    #[error(
        "remaining memory is too fragmented to allocate the prediction cache: \
         close programs, reduce the cache size, or reboot"
    )]
    Fragmented,
}

/// One cached prediction. 128 bytes; all fields relaxed atomics so parallel
/// writers may race. Readers cannot see a locked-consistent entry and instead
/// validate the prior sum against the guard quantum written after the live
/// priors.
#[repr(align(128))]
struct Entry {
    key: AtomicU64,
    value: AtomicU32,
    age: AtomicI32,
    priors: [AtomicU16; MAX_CACHE_MOVES],
}

/// 8-way set-associative bucket with age-based eviction.
#[repr(align(1024))]
struct Chunk {
    entries: [Entry; ENTRIES_PER_CHUNK],
}

impl Chunk {
    fn clear(&self) {
        for entry in &self.entries {
            entry.key.store(0, Ordering::Relaxed);
            entry.age.store(0, Ordering::Relaxed);
        }
    }

    fn try_get(&self, key: u64, move_count: usize, priors_out: &mut [f32]) -> Option<f32> {
        for entry in &self.entries {
            entry.age.fetch_add(1, Ordering::Relaxed);
        }

        for entry in &self.entries {
            if entry.key.load(Ordering::Relaxed) != key {
                continue;
            }
            // Key matches, but the entry may be a fold-level collision or a
            // splice of two writers. Sum the quantized priors for the probing
            // move count; only a near-1.0 total passes. A probe with too many
            // moves picks up the guard quantum and sums near 2.0, one with too
            // few sums short. Use priors_out as scratch even when rejecting.
            let mut prior_sum: i64 = 0;
            for m in 0..move_count {
                let q = entry.priors[m].load(Ordering::Relaxed);
                prior_sum += q as i64;
                priors_out[m] = dequantize_probability(q);
            }

            let expected = PRIOR_QUANTUM_ONE as i64;
            if (prior_sum - expected).abs() > GUARD_ALLOWANCE {
                // Do not freshen: a splice should stay evictable.
                return None;
            }

            entry.age.store(i32::MIN, Ordering::Relaxed);
            return Some(f32::from_bits(entry.value.load(Ordering::Relaxed)));
        }
        None
    }

    /// Overwrite the matching entry if the key is present, else the oldest.
    fn put(&self, key: u64, value: f32, priors: &[f32]) -> PutOutcome {
        let mut victim = 0usize;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.key.load(Ordering::Relaxed) == key {
                victim = i;
                break;
            }
            if entry.age.load(Ordering::Relaxed) > self.entries[victim].age.load(Ordering::Relaxed)
            {
                victim = i;
            }
        }

        let entry = &self.entries[victim];
        let outcome = if entry.key.load(Ordering::Relaxed) != 0 {
            PutOutcome::Evicted
        } else {
            PutOutcome::Fresh
        };

        entry.key.store(key, Ordering::Relaxed);
        entry.value.store(value.to_bits(), Ordering::Relaxed);
        entry.age.store(i32::MIN, Ordering::Relaxed);
        for (m, &p) in priors.iter().enumerate() {
            entry.priors[m].store(quantize_probability(p), Ordering::Relaxed);
        }
        // Guard quantum of 1.0 directly after the live priors, so a probe that
        // reads a different move count almost always fails the sum check.
        if priors.len() < MAX_CACHE_MOVES {
            entry.priors[priors.len()].store(PRIOR_QUANTUM_ONE, Ordering::Relaxed);
        }
        outcome
    }
}

enum PutOutcome {
    Fresh,
    Evicted,
}

/// A contiguous block of chunks from the raw allocator. Zeroed on creation,
/// which doubles as `clear` for fresh tables.
struct Table {
    chunks: NonNull<Chunk>,
    chunk_count: usize,
}

unsafe impl Send for Table {}
unsafe impl Sync for Table {}

impl Table {
    fn try_allocate(chunk_count: usize) -> Option<Self> {
        let layout = Layout::array::<Chunk>(chunk_count).ok()?;
        let raw = unsafe { alloc_zeroed(layout) };
        let chunks = NonNull::new(raw as *mut Chunk)?;
        Some(Self { chunks, chunk_count })
    }

    #[inline]
    fn chunk(&self, index: usize) -> &Chunk {
        debug_assert!(index < self.chunk_count);
        unsafe { &*self.chunks.as_ptr().add(index) }
    }

    fn iter(&self) -> impl Iterator<Item = &Chunk> {
        (0..self.chunk_count).map(move |i| self.chunk(i))
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let layout = Layout::array::<Chunk>(self.chunk_count).unwrap();
        unsafe { dealloc(self.chunks.as_ptr() as *mut u8, layout) };
    }
}

/// Where a missed probe should store its prediction once computed.
#[derive(Clone, Copy)]
pub struct StoreHandle {
    table: usize,
    chunk: usize,
    pub key: u64,
}

pub enum Probe {
    Hit { value: f32 },
    Miss { store: Option<StoreHandle> },
}

/// Sharded, lock-free map from position key to (value, quantized priors).
/// Shared by every searcher; all consistency comes from the guard sum.
pub struct PredictionCache {
    tables: Vec<Table>,
    chunks_per_table: usize,
    allocated_request_gib: u64,
    allocated_min_gib: u64,

    hit_count: AtomicU64,
    eviction_count: AtomicU64,
    probe_count: AtomicU64,
    entry_count: AtomicU64,
    entry_capacity: u64,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            chunks_per_table: 0,
            allocated_request_gib: 0,
            allocated_min_gib: 0,
            hit_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            entry_capacity: 0,
        }
    }

    /// Carve `request_gib` into as few, as large tables as the allocator will
    /// grant: start with 1-GiB tables, halve the table size on failure, and
    /// when the table count would overflow halve the request itself, down to
    /// `min_gib`. Zero sizes leave the cache disabled.
    pub fn allocate(&mut self, request_gib: u64, min_gib: u64) -> Result<(), CacheError> {
        let request_gib = request_gib.max(min_gib);
        for &gib in &[request_gib, min_gib] {
            if gib > MAX_TABLE_COUNT as u64 {
                return Err(CacheError::TooLarge(gib));
            }
            if gib != 0 && !gib.is_power_of_two() {
                return Err(CacheError::NotPowerOfTwo(gib));
            }
        }
        if request_gib == self.allocated_request_gib && min_gib == self.allocated_min_gib {
            return Ok(());
        }
        self.free();
        if request_gib == 0 {
            return Ok(());
        }

        const GIB: usize = 1 << 30;
        let chunk_bytes = std::mem::size_of::<Chunk>();
        debug_assert_eq!(MAX_CHUNKS_PER_TABLE * chunk_bytes, GIB);

        let mut size_gib = request_gib;
        let mut chunks_per_table = MAX_CHUNKS_PER_TABLE;
        loop {
            let table_bytes = chunks_per_table * chunk_bytes;
            let table_count = size_gib as usize * (GIB / table_bytes);

            if table_count > MAX_TABLE_COUNT {
                if size_gib > min_gib {
                    size_gib >>= 1;
                    chunks_per_table = MAX_CHUNKS_PER_TABLE;
                    continue;
                }
                return Err(CacheError::Fragmented);
            }

            if self.try_allocate_tables(table_count, chunks_per_table) {
                self.allocated_request_gib = request_gib;
                self.allocated_min_gib = min_gib;
                log::info!(
                    "allocated prediction cache: {size_gib} GiB in {table_count} tables \
                     (request {request_gib} GiB, min {min_gib} GiB)"
                );
                return Ok(());
            }
            chunks_per_table >>= 1;
        }
    }

    fn try_allocate_tables(&mut self, table_count: usize, chunks_per_table: usize) -> bool {
        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            match Table::try_allocate(chunks_per_table) {
                Some(table) => tables.push(table),
                None => return false,
            }
        }
        self.entry_capacity =
            (table_count * chunks_per_table * ENTRIES_PER_CHUNK) as u64;
        self.chunks_per_table = chunks_per_table;
        self.tables = tables;
        true
    }

    /// Small explicit geometry for tests and benches.
    pub fn with_geometry(table_count: usize, chunks_per_table: usize) -> Self {
        let mut cache = Self::new();
        assert!(table_count <= MAX_TABLE_COUNT && chunks_per_table <= MAX_CHUNKS_PER_TABLE);
        assert!(cache.try_allocate_tables(table_count, chunks_per_table));
        cache
    }

    pub fn free(&mut self) {
        self.tables.clear();
        self.chunks_per_table = 0;
        self.allocated_request_gib = 0;
        self.allocated_min_gib = 0;
        self.entry_capacity = 0;
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
    }

    pub fn is_allocated(&self) -> bool {
        !self.tables.is_empty()
    }

    #[inline]
    fn locate(&self, key: u64) -> (usize, usize) {
        // Top 16 bits xor-folded to 8 pick the table; low 48 xor-folded to 20
        // pick the chunk. The full key stays in the entry, so fold-level
        // collisions are caught there.
        let table_key = (key >> 48) as u16;
        let table = ((table_key & 0xFF) ^ (table_key >> 8)) as usize % self.tables.len();
        let chunk_key = key & 0xFFFF_FFFF_FFFF;
        let chunk = (((chunk_key & 0xF_FFFF) ^ (chunk_key >> 20)) as usize) % self.chunks_per_table;
        (table, chunk)
    }

    /// Look up a position. On a miss the caller receives a handle naming the
    /// chunk that should store the prediction once the network returns.
    pub fn probe(&self, key: u64, move_count: usize, priors_out: &mut [f32]) -> Probe {
        if self.tables.is_empty() || move_count > MAX_CACHE_MOVES {
            return Probe::Miss { store: None };
        }
        self.probe_count.fetch_add(1, Ordering::Relaxed);

        let (table, chunk) = self.locate(key);
        if let Some(value) = self.tables[table].chunk(chunk).try_get(key, move_count, priors_out) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Probe::Hit { value };
        }
        Probe::Miss {
            store: Some(StoreHandle { table, chunk, key }),
        }
    }

    pub fn put(&self, handle: StoreHandle, value: f32, priors: &[f32]) {
        debug_assert!(priors.len() <= MAX_CACHE_MOVES);
        let chunk = self.tables[handle.table].chunk(handle.chunk);
        match chunk.put(handle.key, value, priors) {
            PutOutcome::Evicted => {
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
            }
            PutOutcome::Fresh => {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn clear(&self) {
        for table in &self.tables {
            for chunk in table.iter() {
                chunk.clear();
            }
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
    }

    pub fn reset_probe_metrics(&self) {
        self.hit_count.store(0, Ordering::Relaxed);
        self.eviction_count.store(0, Ordering::Relaxed);
        self.probe_count.store(0, Ordering::Relaxed);
    }

    pub fn permille_full(&self) -> u64 {
        if self.entry_capacity == 0 {
            return 0;
        }
        self.entry_count.load(Ordering::Relaxed) * 1000 / self.entry_capacity
    }

    pub fn permille_hits(&self) -> u64 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        self.hit_count.load(Ordering::Relaxed) * 1000 / probes
    }

    pub fn permille_evictions(&self) -> u64 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        self.eviction_count.load(Ordering::Relaxed) * 1000 / probes
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}
