//! Fast dirty-page logging over up to eight physical memory windows
//!
//! Each configured region gets a presence bitmap (one bit per page) and an
//! append-only first-touch log (one 64-bit frame address per page). The
//! page-write notification path performs an atomic test-and-set on the bitmap
//! and appends to the log only on the first touch, so repeated writes to the
//! same page within one logging interval coalesce into exactly one entry.
//!
//! Reading the per-region log length and resetting it to zero is the
//! once-per-iteration synchronization with the restore loop; the bitmap is
//! cleared by the consumer through the read-write mapping, not by this
//! module.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::mmap::{MmapBuffer, PAGE_SIZE};
use crate::Error;

/// Maximum number of independently tracked regions per session
pub const MAX_REGIONS: usize = 8;

/// Round `size` up to the next page boundary
const fn page_align(size: u64) -> u64 {
    (size + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1)
}

/// One physical memory window to track, as requested by the orchestrator
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct RegionSpec {
    /// Base physical address of the window
    pub base: u64,

    /// Size of the window in bytes; must be a nonzero multiple of the page
    /// size
    pub size: u64,
}

/// Where one region's bitmap and log live inside the shared mapping
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct RegionLayout {
    /// Byte offset of the presence bitmap
    pub bitmap_offset: u64,

    /// Page-aligned size of the presence bitmap
    pub bitmap_size: u64,

    /// Byte offset of the first-touch log
    pub log_offset: u64,

    /// Page-aligned size of the first-touch log
    pub log_size: u64,
}

/// The full layout reported back from a successful configuration; everything
/// the caller needs to map and slice the shared buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyLogLayout {
    /// Per-region offsets and sizes, in configuration order
    pub regions: Vec<RegionLayout>,

    /// Total size of the shared allocation in bytes
    pub total_size: u64,
}

/// Per-region log lengths returned by
/// [`read_and_reset`](DirtyLog::read_and_reset)
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct DirtyCounts {
    /// Number of configured regions
    pub num: u8,

    /// Log length per region; entries past `num` are zero
    pub values: [u64; MAX_REGIONS],
}

/// One tracked region's hot-path state
struct DirtyRegion {
    /// Base physical address
    base: u64,

    /// Size in bytes
    size: u64,

    /// Byte offset of the bitmap inside the shared allocation
    bitmap_offset: usize,

    /// Byte offset of the log inside the shared allocation
    log_offset: usize,

    /// Capacity of the log in entries (`size / PAGE_SIZE`)
    log_max: u64,

    /// Next free log slot
    log_index: AtomicU64,
}

impl DirtyRegion {
    /// Whether `page` (page-aligned physical address) falls inside this
    /// region
    fn contains(&self, page: u64) -> bool {
        page >= self.base && page < self.base + self.size
    }
}

/// Everything behind a successful one-shot configuration
struct DirtySession {
    /// The shared bitmap+log allocation, in region configuration order
    buf: MmapBuffer,

    /// The tracked regions
    regions: Vec<DirtyRegion>,

    /// The layout reported at configuration time
    layout: DirtyLogLayout,
}

impl DirtySession {
    /// Atomic view of one 64-bit bitmap word of `region`
    ///
    /// The shared allocation outlives every recording path, so the raw
    /// pointer arithmetic stays in bounds as long as `word` is within the
    /// region's bitmap.
    fn bitmap_word(&self, region: &DirtyRegion, word: usize) -> &AtomicU64 {
        debug_assert!(word < (region.log_max as usize).div_ceil(64));
        unsafe {
            &*self
                .buf
                .as_ptr()
                .add(region.bitmap_offset + word * 8)
                .cast::<AtomicU64>()
        }
    }

    /// Atomic view of one log slot of `region`
    fn log_slot(&self, region: &DirtyRegion, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < region.log_max as usize);
        unsafe {
            &*self
                .buf
                .as_ptr()
                .add(region.log_offset + slot * 8)
                .cast::<AtomicU64>()
        }
    }
}

/// Dirty-page logger for one VM session.
///
/// Created empty; armed by a single [`configure`](Self::configure) call. The
/// recording hot path allocates nothing and takes no lock beyond the per-page
/// atomic test-and-set.
pub struct DirtyLog {
    /// Slot for the one-shot session; the atomic state gate makes `record`
    /// safe to race against configuration
    session: spin::Once<DirtySession>,

    /// Number of addresses dropped because no region matched
    dropped: AtomicUsize,
}

impl Default for DirtyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyLog {
    /// Create an unconfigured logger
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: spin::Once::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// One-shot configuration: validate the region table, compute the
    /// bitmap/log layout, and allocate one contiguous zeroed buffer backing
    /// all of it. Returns the layout the caller needs to map the buffer.
    ///
    /// Regions may not overlap; if overlap tracking is ever required the
    /// recorder's highest-index-first scan decides the winner.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] on a second configuration attempt or an
    ///   empty region table
    /// * [`Error::TooManyRegions`] for more than [`MAX_REGIONS`] regions
    ///   (nothing is allocated)
    /// * [`Error::BadRegionSize`] for a zero or non-page-multiple size
    /// * [`Error::OverlappingRegions`] if any two regions intersect
    /// * [`Error::AllocationFailed`] if the backing allocation fails; the
    ///   logger stays unconfigured
    pub fn configure(&self, specs: &[RegionSpec]) -> Result<DirtyLogLayout, Error> {
        if specs.is_empty() {
            return Err(Error::InvalidOperation);
        }

        if specs.len() > MAX_REGIONS {
            return Err(Error::TooManyRegions(specs.len()));
        }

        for spec in specs {
            if spec.size == 0 || spec.size % PAGE_SIZE as u64 != 0 {
                return Err(Error::BadRegionSize(spec.size));
            }
        }

        // Reject overlap outright rather than relying on scan-order priority
        for (i, a) in specs.iter().enumerate() {
            for b in &specs[i + 1..] {
                if a.base < b.base + b.size && b.base < a.base + a.size {
                    return Err(Error::OverlappingRegions);
                }
            }
        }

        // Lay out bitmap-then-log per region, page aligned, in order
        let mut total_size = 0u64;
        let mut layouts = Vec::with_capacity(specs.len());

        for spec in specs {
            let pages = spec.size / PAGE_SIZE as u64;

            let bitmap_offset = total_size;
            let bitmap_size = page_align(pages.div_ceil(8));
            total_size += bitmap_size;

            let log_offset = total_size;
            let log_size = page_align(pages * 8);
            total_size += log_size;

            layouts.push(RegionLayout {
                bitmap_offset,
                bitmap_size,
                log_offset,
                log_size,
            });
        }

        let buf = MmapBuffer::new(total_size as usize)?;

        let regions = specs
            .iter()
            .zip(&layouts)
            .map(|(spec, layout)| DirtyRegion {
                base: spec.base,
                size: spec.size,
                bitmap_offset: layout.bitmap_offset as usize,
                log_offset: layout.log_offset as usize,
                log_max: spec.size / PAGE_SIZE as u64,
                log_index: AtomicU64::new(0),
            })
            .collect();

        let layout = DirtyLogLayout {
            regions: layouts,
            total_size,
        };

        let mut fresh = false;
        self.session.call_once(|| {
            fresh = true;
            DirtySession {
                buf,
                regions,
                layout: layout.clone(),
            }
        });

        // Configuration is allowed exactly once
        if !fresh {
            return Err(Error::InvalidOperation);
        }

        log::info!(
            "Dirty log configured: {} regions, {total_size:#x} bytes",
            specs.len()
        );

        Ok(layout)
    }

    /// Record a guest write to physical address `gpa`.
    ///
    /// Locates the enclosing region (highest configured index first), sets
    /// the page's presence bit, and on the first touch appends the page
    /// frame address to the region's log. Returns `false` when no region
    /// matches; the write is dropped and counted.
    ///
    /// Hot path: no allocation, no lock.
    pub fn record(&self, gpa: u64) -> bool {
        let Some(session) = self.session.get() else {
            return false;
        };

        let page = gpa & !(PAGE_SIZE as u64 - 1);

        let Some(region) = session
            .regions
            .iter()
            .rev()
            .find(|region| region.contains(page))
        else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dirty write outside all tracked regions: {gpa:#x}");
            return false;
        };

        let page_index = (page - region.base) / PAGE_SIZE as u64;
        let word = (page_index / 64) as usize;
        let bit = page_index % 64;

        let prev = session
            .bitmap_word(region, word)
            .fetch_or(1 << bit, Ordering::AcqRel);

        // First touch of this page in the current interval
        if prev & (1 << bit) == 0 {
            let slot = region.log_index.fetch_add(1, Ordering::Relaxed);

            // The bitmap admits at most one append per page, so the log can
            // only run out if something upstream miscounted
            if slot >= region.log_max {
                log::error!("Dirty log capacity exceeded: slot {slot} >= {}", region.log_max);
                return false;
            }

            session
                .log_slot(region, slot as usize)
                .store(page, Ordering::Relaxed);
        }

        true
    }

    /// Return the current log length of every region and reset each length
    /// to zero. Logical truncation only; log contents and bitmaps are left
    /// in place.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] before configuration
    pub fn read_and_reset(&self) -> Result<DirtyCounts, Error> {
        let session = self.session.get().ok_or(Error::InvalidOperation)?;

        let mut counts = DirtyCounts {
            num: session.regions.len() as u8,
            values: [0; MAX_REGIONS],
        };

        for (i, region) in session.regions.iter().enumerate() {
            counts.values[i] = region.log_index.swap(0, Ordering::AcqRel);
        }

        Ok(counts)
    }

    /// Reset every region's log length to zero without reporting them
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] before configuration
    pub fn flush(&self) -> Result<(), Error> {
        let session = self.session.get().ok_or(Error::InvalidOperation)?;

        for region in &session.regions {
            region.log_index.store(0, Ordering::Release);
        }

        Ok(())
    }

    /// The layout reported at configuration time, if configured
    #[must_use]
    pub fn layout(&self) -> Option<&DirtyLogLayout> {
        self.session.get().map(|session| &session.layout)
    }

    /// The whole shared allocation, for the zero-copy read-write mapping.
    ///
    /// Laid out bitmap-then-log per region in configuration order. The
    /// recording path writes in here concurrently; a reader gets no
    /// transactional boundary beyond the atomicity of the individual words.
    /// Clearing the bitmaps between logging intervals is the consumer's job,
    /// through this mapping.
    #[must_use]
    pub fn mapping(&self) -> Option<&[u8]> {
        self.session.get().map(|session| session.buf.as_slice())
    }

    /// Raw parts of the shared allocation for an external mapper
    #[must_use]
    pub fn raw_parts(&self) -> Option<(*mut u8, usize)> {
        self.session
            .get()
            .map(|session| (session.buf.as_ptr(), session.buf.len()))
    }

    /// Number of writes dropped because no region matched
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn configured(specs: &[RegionSpec]) -> (DirtyLog, DirtyLogLayout) {
        let log = DirtyLog::new();
        let layout = log.configure(specs).unwrap();
        (log, layout)
    }

    /// Read log entry `slot` of the region described by `layout` from the
    /// shared mapping
    fn log_entry(log: &DirtyLog, layout: &RegionLayout, slot: usize) -> u64 {
        let mapping = log.mapping().unwrap();
        let off = layout.log_offset as usize + slot * 8;
        u64::from_le_bytes(mapping[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn layout_is_bitmap_then_log_per_region() {
        let (_log, layout) = configured(&[
            RegionSpec { base: 0, size: 0x100_0000 },
            RegionSpec { base: 0x4000_0000, size: 0x20_0000 },
        ]);

        assert_eq!(layout.regions.len(), 2);

        // 0x100_0000 = 4096 pages: 512-byte bitmap padded to a page,
        // 32 KiB log
        let a = layout.regions[0];
        assert_eq!(a.bitmap_offset, 0);
        assert_eq!(a.bitmap_size, PAGE);
        assert_eq!(a.log_offset, PAGE);
        assert_eq!(a.log_size, 4096 * 8);

        // Second region packs right behind the first
        let b = layout.regions[1];
        assert_eq!(b.bitmap_offset, a.log_offset + a.log_size);
        assert_eq!(
            layout.total_size,
            b.log_offset + b.log_size
        );
    }

    #[test]
    fn repeated_writes_coalesce() {
        let (log, layout) = configured(&[RegionSpec { base: 0x1000_0000, size: 0x10 * PAGE }]);

        // Three writes into page 7 of the region, different offsets
        assert!(log.record(0x1000_0000 + 7 * PAGE));
        assert!(log.record(0x1000_0000 + 7 * PAGE + 0x10));
        assert!(log.record(0x1000_0000 + 7 * PAGE + 0xfff));

        let counts = log.read_and_reset().unwrap();
        assert_eq!(counts.num, 1);
        assert_eq!(counts.values[0], 1);

        // The single entry is the page frame address
        assert_eq!(log_entry(&log, &layout.regions[0], 0), 0x1000_0000 + 7 * PAGE);

        // Nothing new: counts stay zero
        assert_eq!(log.read_and_reset().unwrap().values[0], 0);

        // The presence bit survives the count reset, so another write to the
        // same page still coalesces; a fresh page appends
        assert!(log.record(0x1000_0000 + 7 * PAGE));
        assert_eq!(log.read_and_reset().unwrap().values[0], 0);
        assert!(log.record(0x1000_0000 + 3 * PAGE));
        assert_eq!(log.read_and_reset().unwrap().values[0], 1);
    }

    #[test]
    fn unmatched_addresses_are_dropped() {
        let (log, _layout) = configured(&[RegionSpec { base: 0x1000, size: PAGE }]);

        assert!(!log.record(0x9999_0000));
        assert_eq!(log.dropped(), 1);

        // No region state was touched
        assert_eq!(log.read_and_reset().unwrap().values[0], 0);
        assert!(log.mapping().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn configuration_is_one_shot() {
        let (log, _layout) = configured(&[RegionSpec { base: 0, size: PAGE }]);

        assert!(matches!(
            log.configure(&[RegionSpec { base: 0, size: PAGE }]),
            Err(Error::InvalidOperation)
        ));
    }

    #[test]
    fn nine_regions_rejected_without_allocation() {
        let log = DirtyLog::new();
        let specs = vec![RegionSpec { base: 0, size: PAGE }; 9];

        assert!(matches!(
            log.configure(&specs),
            Err(Error::TooManyRegions(9))
        ));

        // Nothing was allocated or armed
        assert!(log.layout().is_none());
        assert!(log.read_and_reset().is_err());
    }

    #[test]
    fn bad_sizes_rejected() {
        let log = DirtyLog::new();

        assert!(matches!(
            log.configure(&[RegionSpec { base: 0, size: 0 }]),
            Err(Error::BadRegionSize(0))
        ));
        assert!(matches!(
            log.configure(&[RegionSpec { base: 0, size: PAGE + 1 }]),
            Err(Error::BadRegionSize(_))
        ));
    }

    #[test]
    fn overlapping_regions_rejected() {
        let log = DirtyLog::new();

        assert!(matches!(
            log.configure(&[
                RegionSpec { base: 0x0000, size: 4 * PAGE },
                RegionSpec { base: 0x2000, size: 4 * PAGE },
            ]),
            Err(Error::OverlappingRegions)
        ));

        // Adjacent regions are fine
        assert!(log
            .configure(&[
                RegionSpec { base: 0x0000, size: 2 * PAGE },
                RegionSpec { base: 0x2000, size: 2 * PAGE },
            ])
            .is_ok());
    }

    #[test]
    fn flush_resets_counts_silently() {
        let (log, _layout) = configured(&[RegionSpec { base: 0, size: 4 * PAGE }]);

        log.record(0x0);
        log.record(0x1000);
        log.flush().unwrap();

        assert_eq!(log.read_and_reset().unwrap().values[0], 0);
    }

    #[test]
    fn first_touch_order_is_preserved() {
        let (log, layout) = configured(&[RegionSpec { base: 0x8000_0000, size: 8 * PAGE }]);

        for page in [5u64, 1, 6, 2] {
            log.record(0x8000_0000 + page * PAGE);
        }

        let counts = log.read_and_reset().unwrap();
        assert_eq!(counts.values[0], 4);

        for (slot, page) in [5u64, 1, 6, 2].iter().enumerate() {
            assert_eq!(
                log_entry(&log, &layout.regions[0], slot),
                0x8000_0000 + page * PAGE
            );
        }
    }

    #[test]
    fn recording_before_configuration_is_inert() {
        let log = DirtyLog::new();
        assert!(!log.record(0x1000));
    }
}
