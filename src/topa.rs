//! Fixed two-extent ToPA ring buffer
//!
//! The trace output is routed through a three-entry Table of Physical
//! Addresses: a large main extent that raises an interrupt when it fills, a
//! small fallback extent that forces a hardware stop when it fills, and a
//! terminal entry pointing back at the table itself. The interrupt gives a
//! well-behaved consumer time to drain proactively; the fallback bounds the
//! worst-case capture when the consumer is late, so at most one fallback's
//! worth of slack is ever in flight and nothing is lost silently.
//!
//! All three allocations happen once at engine creation and are never
//! reallocated: overflow handling truncates logically by resetting the output
//! pointers.

use crate::mmap::{MmapBuffer, PAGE_SIZE};
use crate::Error;

/// Main extent size in pages, as a power of two (4 MiB)
pub const TOPA_MAIN_ORDER: u64 = 10;

/// Fallback extent size in pages, as a power of two (64 KiB)
pub const TOPA_FALLBACK_ORDER: u64 = 4;

/// Size of the main extent in bytes
pub const TOPA_MAIN_SIZE: u64 = (1 << TOPA_MAIN_ORDER) * PAGE_SIZE as u64;

/// Size of the fallback extent in bytes
pub const TOPA_FALLBACK_SIZE: u64 = (1 << TOPA_FALLBACK_ORDER) * PAGE_SIZE as u64;

/// Marker byte stamped just past the captured data to bound consumer reads
pub const PT_TRACE_END: u8 = 0b0101_0101;

/// ToPA entry flag: raise a PMI when this extent fills
const TOPA_INT: u64 = 1 << 2;

/// ToPA entry flag: stop tracing when this extent fills
const TOPA_STOP: u64 = 1 << 4;

/// ToPA entry flag: this entry points at the next table, not at an extent
const TOPA_END: u64 = 1 << 0;

/// Bit position of the extent-size field in a ToPA entry
const TOPA_SIZE_SHIFT: u64 = 6;

/// Low-word bits of `IA32_RTIT_OUTPUT_MASK_PTRS` selecting the current table
/// entry; nonzero means output is past entry 0 (the main extent)
const TOPA_TABLE_OFFSET_MASK: u64 = 0x0000_0000_FFFF_FF80;

/// Initial value of `IA32_RTIT_OUTPUT_MASK_PTRS`: entry 0, offset 0
const OUTPUT_MASK_PTRS_INIT: u64 = 0x7f;

/// The two-extent ring and its descriptor table, plus the software mirror of
/// the hardware output registers.
pub struct TopaRing {
    /// The descriptor table: `[main | INT, fallback | STOP, self | END]`
    table: MmapBuffer,

    /// Main trace extent
    main: MmapBuffer,

    /// Fallback trace extent
    fallback: MmapBuffer,

    /// Software copy of `IA32_RTIT_OUTPUT_BASE`
    pub(crate) output_base: u64,

    /// Software copy of `IA32_RTIT_OUTPUT_MASK_PTRS`
    pub(crate) output_mask_ptrs: u64,

    /// Post-setup value of `IA32_RTIT_OUTPUT_BASE`, restored on reset
    output_base_init: u64,

    /// Post-setup value of `IA32_RTIT_OUTPUT_MASK_PTRS`, restored on reset
    output_mask_ptrs_init: u64,
}

impl TopaRing {
    /// Allocate the two extents and the descriptor table and close them into
    /// a ring.
    ///
    /// The table entries carry the extents' host addresses; the platform's
    /// register access is responsible for any address translation its
    /// hardware needs.
    ///
    /// # Errors
    ///
    /// * [`Error::AllocationFailed`] if any backing allocation fails; partial
    ///   allocations are released before returning
    pub fn new() -> Result<Self, Error> {
        let main = MmapBuffer::new(TOPA_MAIN_SIZE as usize)?;
        let fallback = MmapBuffer::new(TOPA_FALLBACK_SIZE as usize)?;
        let table = MmapBuffer::new(PAGE_SIZE)?;

        let table_addr = table.as_ptr() as u64;

        let entries = [
            main.as_ptr() as u64 | (TOPA_MAIN_ORDER << TOPA_SIZE_SHIFT) | TOPA_INT,
            fallback.as_ptr() as u64 | (TOPA_FALLBACK_ORDER << TOPA_SIZE_SHIFT) | TOPA_STOP,
            table_addr | TOPA_END,
        ];

        for (i, entry) in entries.iter().enumerate() {
            for (j, byte) in entry.to_le_bytes().iter().enumerate() {
                table.write_byte(i * 8 + j, *byte);
            }
        }

        Ok(Self {
            table,
            main,
            fallback,
            output_base: table_addr,
            output_mask_ptrs: OUTPUT_MASK_PTRS_INIT,
            output_base_init: table_addr,
            output_mask_ptrs_init: OUTPUT_MASK_PTRS_INIT,
        })
    }

    /// Logical number of trace bytes currently captured in the ring.
    ///
    /// Decodes the mirrored output-mask register: if the table-offset bits
    /// select an entry past the main extent, output has spilled into the
    /// fallback and the size is `TOPA_MAIN_SIZE` plus the offset; otherwise
    /// the size is the offset into the main extent. In both cases a terminal
    /// marker byte is stamped just past the data (when in bounds) so a
    /// consumer scanning the mapping knows where the capture ends.
    pub fn current_size(&self) -> u64 {
        let mask_ptrs = self.output_mask_ptrs;
        let offset = mask_ptrs >> 32;

        if mask_ptrs & TOPA_TABLE_OFFSET_MASK != 0 {
            if offset < TOPA_FALLBACK_SIZE {
                self.fallback.write_byte(offset as usize, PT_TRACE_END);
            }
            return TOPA_MAIN_SIZE + offset;
        }

        if offset < TOPA_MAIN_SIZE {
            self.main.write_byte(offset as usize, PT_TRACE_END);
        }
        offset
    }

    /// Restore the output registers to their post-setup values.
    ///
    /// Destructive: any bytes not yet drained by the consumer become
    /// unrecoverable once the hardware overwrites them.
    pub fn reset(&mut self) {
        self.output_base = self.output_base_init;
        self.output_mask_ptrs = self.output_mask_ptrs_init;
    }

    /// Check whether the main extent has filled up; if so, reset the output
    /// pointers and return the pre-reset logical size. Returns 0 when there
    /// is still room.
    pub fn check_overflow(&mut self) -> u64 {
        let bytes = self.current_size();

        if bytes >= TOPA_MAIN_SIZE {
            self.reset();
            return bytes;
        }

        0
    }

    /// Total number of mappable trace bytes (both extents)
    #[must_use]
    pub fn buffer_size(&self) -> u64 {
        TOPA_MAIN_SIZE + TOPA_FALLBACK_SIZE
    }

    /// Read-only view of the main extent
    #[must_use]
    pub fn main(&self) -> &[u8] {
        self.main.as_slice()
    }

    /// Read-only view of the fallback extent
    #[must_use]
    pub fn fallback(&self) -> &[u8] {
        self.fallback.as_slice()
    }

    /// Host address of the descriptor table, as programmed into
    /// `IA32_RTIT_OUTPUT_BASE`
    #[must_use]
    pub fn table_addr(&self) -> u64 {
        self.table.as_ptr() as u64
    }

    /// Raw parts of the main extent, for views that outlive a lock guard
    pub(crate) fn main_raw_parts(&self) -> (*const u8, usize) {
        (self.main.as_ptr(), self.main.len())
    }

    /// Raw parts of the fallback extent
    pub(crate) fn fallback_raw_parts(&self) -> (*const u8, usize) {
        (self.fallback.as_ptr(), self.fallback.len())
    }
}
