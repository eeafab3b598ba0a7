//! Edge coverage for trace-pc-guard instrumented engines.
//!
//! The instrumented binary owns a table of 32-bit guard slots, one per edge.
//! On attach (and after every execution) each slot receives a dense 1-based
//! index; the first time an edge fires its bit `index - 1` is set in the
//! coverage bitmap and the slot is zeroed so later hits in the same epoch
//! cost a single load.
//!
//! The bitmap lives in a POSIX shared memory segment named by `SHM_ID` so
//! the supervising fuzzer can read it, or in a private buffer when no segment
//! is configured. Layout: a `u32` edge-count header followed by the bits.
//!
//! `record` takes no lock. Two threads hitting the same fresh edge may race
//! between loading the index and zeroing the slot; both then set the same
//! bit, or one sees 0 and returns. At most one observation is lost and no
//! foreign bit is ever set.

use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;

/// Size of the coverage region shared with the fuzzer, header included.
pub const SHM_SIZE: usize = 0x100000;
/// Bytes taken by the edge-count header.
pub const HEADER_SIZE: usize = 4;
/// Number of edges the default region can represent.
pub const MAX_EDGES: usize = (SHM_SIZE - HEADER_SIZE) * 8;
/// Environment variable naming the shared memory segment.
pub const SHM_ENV_VAR: &str = "SHM_ID";

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("region of {0} bytes cannot hold the edge-count header")]
    RegionTooSmall(usize),
    #[error("shared memory key {0:?} contains a NUL byte")]
    InvalidKey(String),
    #[error("failed to open shared memory region {key:?}: {source}")]
    Open {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map shared memory region {key:?}: {source}")]
    Map {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

enum Backing {
    Shared { base: NonNull<u8>, key: String },
    // u32 words keep the header aligned.
    Private(Box<[AtomicU32]>),
}

/// The bitmap region: header word plus edge bits, accessed only through atomics.
pub struct CoverageMap {
    backing: Backing,
    len: usize,
}

// The region is only ever touched through atomic views, and a shared
// mapping stays valid until drop.
unsafe impl Send for CoverageMap {}
unsafe impl Sync for CoverageMap {}

impl CoverageMap {
    /// Allocates a zeroed region owned by this process alone.
    pub fn private(len: usize) -> Result<Self, CoverageError> {
        if len < HEADER_SIZE {
            return Err(CoverageError::RegionTooSmall(len));
        }
        let words = len.div_ceil(4);
        let storage: Box<[AtomicU32]> = (0..words).map(|_| AtomicU32::new(0)).collect();
        Ok(Self {
            backing: Backing::Private(storage),
            len,
        })
    }

    /// Maps an existing POSIX shared memory segment created by the fuzzer.
    pub fn open_shared(key: &str, len: usize) -> Result<Self, CoverageError> {
        if len < HEADER_SIZE {
            return Err(CoverageError::RegionTooSmall(len));
        }
        let c_key = CString::new(key).map_err(|_| CoverageError::InvalidKey(key.to_string()))?;

        let fd = unsafe {
            libc::shm_open(
                c_key.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(CoverageError::Open {
                key: key.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let map_error = std::io::Error::last_os_error();
        // The mapping keeps the segment alive on its own.
        unsafe { libc::close(fd) };

        if addr == libc::MAP_FAILED {
            return Err(CoverageError::Map {
                key: key.to_string(),
                source: map_error,
            });
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| CoverageError::Map {
            key: key.to_string(),
            source: std::io::Error::other("mmap returned a null mapping"),
        })?;

        Ok(Self {
            backing: Backing::Shared {
                base,
                key: key.to_string(),
            },
            len,
        })
    }

    fn base(&self) -> *const u8 {
        match &self.backing {
            Backing::Shared { base, .. } => base.as_ptr(),
            Backing::Private(words) => words.as_ptr().cast::<u8>(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared { .. })
    }

    /// Name of the shared segment, if any.
    pub fn shared_key(&self) -> Option<&str> {
        match &self.backing {
            Backing::Shared { key, .. } => Some(key),
            Backing::Private(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_edges(&self) -> usize {
        (self.len - HEADER_SIZE) * 8
    }

    fn header(&self) -> &AtomicU32 {
        // Both backings start on at least a 4-byte boundary.
        unsafe { &*self.base().cast::<AtomicU32>() }
    }

    fn edge_bytes(&self) -> &[AtomicU8] {
        unsafe {
            std::slice::from_raw_parts(
                self.base().add(HEADER_SIZE).cast::<AtomicU8>(),
                self.len - HEADER_SIZE,
            )
        }
    }

    pub fn num_edges(&self) -> u32 {
        self.header().load(Ordering::Relaxed)
    }

    fn set_num_edges(&self, edges: u32) {
        self.header().store(edges, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_edge(&self, bit: usize) {
        if let Some(byte) = self.edge_bytes().get(bit / 8) {
            byte.fetch_or(1 << (bit % 8), Ordering::Relaxed);
        }
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.edge_bytes()
            .get(bit / 8)
            .is_some_and(|byte| byte.load(Ordering::Relaxed) & (1 << (bit % 8)) != 0)
    }

    /// Zeroes the edge bits; the header is left as is.
    pub fn clear(&self) {
        for byte in self.edge_bytes() {
            byte.store(0, Ordering::Relaxed);
        }
    }

    /// Indices of all set bits, in ascending order.
    pub fn covered_edges(&self) -> Vec<usize> {
        let mut covered = Vec::new();
        for (i, byte) in self.edge_bytes().iter().enumerate() {
            let value = byte.load(Ordering::Relaxed);
            if value == 0 {
                continue;
            }
            for bit in 0..8 {
                if value & (1 << bit) != 0 {
                    covered.push(i * 8 + bit);
                }
            }
        }
        covered
    }
}

impl Drop for CoverageMap {
    fn drop(&mut self) {
        if let Backing::Shared { base, .. } = &self.backing {
            unsafe { libc::munmap(base.as_ptr().cast(), self.len) };
        }
    }
}

impl std::fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageMap")
            .field("shared_key", &self.shared_key())
            .field("len", &self.len)
            .field("num_edges", &self.num_edges())
            .finish()
    }
}

/// Guard table of one instrumented module bound to a bitmap.
#[derive(Debug)]
pub struct CoverageTracker<'a> {
    guards: &'a [AtomicU32],
    map: CoverageMap,
}

impl<'a> CoverageTracker<'a> {
    /// Binds `guards` to `map`, writes the tracked edge count into the header
    /// and starts the first epoch.
    pub fn new(guards: &'a [AtomicU32], map: CoverageMap) -> Self {
        let tracker = Self { guards, map };
        let tracked = u32::try_from(tracker.tracked_edges()).unwrap_or(u32::MAX);
        tracker.map.set_num_edges(tracked);
        tracker.reset();
        tracker
    }

    /// Total number of guard slots in the table.
    pub fn edge_count(&self) -> usize {
        self.guards.len()
    }

    /// Number of slots that receive an index; the rest exceed the bitmap.
    pub fn tracked_edges(&self) -> usize {
        self.guards.len().min(self.map.max_edges())
    }

    pub fn map(&self) -> &CoverageMap {
        &self.map
    }

    pub fn guards(&self) -> &'a [AtomicU32] {
        self.guards
    }

    fn covers(&self, table: &[AtomicU32]) -> bool {
        std::ptr::eq(self.guards.as_ptr(), table.as_ptr()) && self.guards.len() == table.len()
    }

    /// Starts a new epoch by handing every tracked slot a fresh index.
    ///
    /// A private bitmap is cleared here as well. A shared one belongs to the
    /// fuzzer, which clears it after reading the previous epoch.
    pub fn reset(&self) {
        let tracked = self.tracked_edges();
        for (index, slot) in self.guards[..tracked].iter().enumerate() {
            slot.store(index as u32 + 1, Ordering::Relaxed);
        }
        if !self.map.is_shared() {
            self.map.clear();
        }
    }

    /// Instrumentation hot path, called at every edge.
    #[inline]
    pub fn record(&self, slot: &AtomicU32) {
        let index = slot.load(Ordering::Relaxed);
        if index == 0 {
            return;
        }
        self.map.set_edge(index as usize - 1);
        slot.store(0, Ordering::Relaxed);
    }

    pub fn covered_edges(&self) -> Vec<usize> {
        self.map.covered_edges()
    }
}

/// Where the bitmap of the first attached module comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapSource {
    /// Shared segment named by the environment variable, private fallback if unset.
    Environment { var: &'static str, size: usize },
    Private { size: usize },
}

impl BitmapSource {
    fn open(self) -> Result<CoverageMap, CoverageError> {
        match self {
            BitmapSource::Environment { var, size } => match std::env::var(var) {
                Ok(key) if !key.is_empty() => CoverageMap::open_shared(&key, size),
                _ => {
                    tracing::info!("no shared memory bitmap configured, using a private buffer");
                    CoverageMap::private(size)
                }
            },
            BitmapSource::Private { size } => CoverageMap::private(size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached { edges: usize, tracked: usize },
    /// Start and end coincide.
    Degenerate,
    /// The same table was attached before, or its first slot is already set.
    AlreadyInitialized,
    /// A different module is already attached; its edges are not tracked.
    Rejected { edges: usize },
}

/// Process-wide owner of the single coverage source.
pub struct CoverageRegistry<'a> {
    tracker: OnceLock<CoverageTracker<'a>>,
    source: BitmapSource,
    rejected: AtomicUsize,
}

impl<'a> CoverageRegistry<'a> {
    pub const fn new(source: BitmapSource) -> Self {
        Self {
            tracker: OnceLock::new(),
            source,
            rejected: AtomicUsize::new(0),
        }
    }

    pub const fn from_environment() -> Self {
        Self::new(BitmapSource::Environment {
            var: SHM_ENV_VAR,
            size: SHM_SIZE,
        })
    }

    pub fn tracker(&self) -> Option<&CoverageTracker<'a>> {
        self.tracker.get()
    }

    /// Number of modules turned away because another one was attached first.
    pub fn rejected_modules(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn attach(&self, table: &'a [AtomicU32]) -> Result<AttachOutcome, CoverageError> {
        if table.is_empty() {
            return Ok(AttachOutcome::Degenerate);
        }

        if table[0].load(Ordering::Relaxed) != 0 {
            return Ok(AttachOutcome::AlreadyInitialized);
        }

        if let Some(tracker) = self.tracker.get() {
            return Ok(self.refuse(tracker, table));
        }

        let map = self.source.open()?;
        let candidate = CoverageTracker::new(table, map);
        let edges = candidate.edge_count();
        let tracked = candidate.tracked_edges();

        match self.tracker.set(candidate) {
            Ok(()) => {
                tracing::info!(
                    edges,
                    tracked,
                    shared = ?self.tracker().and_then(|t| t.map().shared_key()),
                    "edge counters initialized"
                );
                Ok(AttachOutcome::Attached { edges, tracked })
            }
            // Lost a race against a concurrent attach.
            Err(_) => match self.tracker.get() {
                Some(tracker) => Ok(self.refuse(tracker, table)),
                None => Ok(AttachOutcome::AlreadyInitialized),
            },
        }
    }

    fn refuse(&self, tracker: &CoverageTracker<'a>, table: &[AtomicU32]) -> AttachOutcome {
        if tracker.covers(table) {
            return AttachOutcome::AlreadyInitialized;
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            edges = table.len(),
            "found new module with {} edges, skipping",
            table.len()
        );
        AttachOutcome::Rejected { edges: table.len() }
    }

    #[inline]
    pub fn record(&self, slot: &AtomicU32) {
        if let Some(tracker) = self.tracker.get() {
            tracker.record(slot);
        }
    }
}

/// Something that can start a fresh coverage epoch between executions.
pub trait EpochReset {
    fn reset_epoch(&self);
}

impl EpochReset for CoverageRegistry<'_> {
    fn reset_epoch(&self) {
        if let Some(tracker) = self.tracker.get() {
            tracker.reset();
        }
    }
}

impl EpochReset for CoverageTracker<'_> {
    fn reset_epoch(&self) {
        self.reset();
    }
}

impl<T: EpochReset + ?Sized> EpochReset for &T {
    fn reset_epoch(&self) {
        (**self).reset_epoch();
    }
}

/// Registry fed by the exported instrumentation callbacks.
pub static GLOBAL_COVERAGE: CoverageRegistry<'static> = CoverageRegistry::from_environment();

#[cfg(feature = "sancov")]
mod callbacks {
    use super::{AttachOutcome, GLOBAL_COVERAGE};
    use std::sync::atomic::AtomicU32;

    /// Called by each instrumented module's constructor with its guard table.
    ///
    /// # Safety
    /// `start..stop` must be the module's guard array, valid for the rest of
    /// the process lifetime.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
        if start.is_null() || stop <= start {
            return;
        }
        let len = unsafe { stop.offset_from(start) } as usize;
        let table: &'static [AtomicU32] =
            unsafe { std::slice::from_raw_parts(start.cast::<AtomicU32>(), len) };

        match GLOBAL_COVERAGE.attach(table) {
            Ok(AttachOutcome::Rejected { edges }) => {
                // Constructors may run before any subscriber exists.
                eprintln!("[COV] found new module with {edges} edges, skipping");
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("[COV] {e}");
                std::process::exit(crate::FATAL_EXIT_CODE);
            }
        }
    }

    /// Called at every instrumented edge.
    ///
    /// # Safety
    /// `guard` must point into the table passed to the init callback.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
        if guard.is_null() {
            return;
        }
        let slot = unsafe { AtomicU32::from_ptr(guard) };
        GLOBAL_COVERAGE.record(slot);
    }
}
