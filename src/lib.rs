//! # vmtrace
//!
//! Hardware-assisted execution tracing and dirty-page logging for
//! snapshot-driven VM fuzzing
//!
//! vmtrace owns the two introspection data paths a snapshot fuzzer leans on
//! every iteration: an Intel Processor Trace session whose packet stream
//! lands in a two-extent table-of-physical-addresses ring, and a fast
//! dirty-page log that records the first write to each guest page so the
//! restore loop only touches what changed.
//!
//! Both paths are built for the VM entry/exit cadence. Control operations
//! (filters, enable/disable) stage state while the guest is out; the actual
//! register programming happens inside [`TraceEngine::vmentry`], and the
//! hardware's side of the story is read back in [`GuestWindow::vmexit`]. A
//! consumer maps the trace extents and the dirty bitmap+log zero-copy and
//! polls sizes/counts through the control surface.
//!
//! ## Roadmap of the repo:
//!
//! * [`Session`] - One VM's worth of introspection state; owns the trace
//!   engine and the dirty log
//! * [`TraceEngine`] - Filter configuration, the deferred enable/disable
//!   state machine, and the per-slice entry/exit hooks:
//!     - [`TraceEngine::configure_filter`]
//!     - [`TraceEngine::enable`] / [`TraceEngine::disable`]
//!     - [`TraceEngine::vmentry`] returning a [`GuestWindow`]
//! * [`DirtyLog`] - Up to eight tracked regions, one atomic bitmap and
//!   first-touch log each:
//!     - [`DirtyLog::configure`]
//!     - [`DirtyLog::record`]
//!     - [`DirtyLog::read_and_reset`]
//! * [`RtitHardware`] - The seam the embedding platform implements to give
//!   the engine MSR access; [`RegisterFile`] is the in-memory test double
//! * [`TraceCommand`] / [`DirtyLogCommand`] - Serializable control surface

#![deny(missing_docs)]

pub use anyhow;
use anyhow::{Context, Result};

pub mod caps;
pub use caps::TraceCapabilities;

pub mod control;
pub use control::{DirtyLogCommand, DirtyLogReply, TraceCommand};

pub mod dirty;
pub use dirty::{DirtyCounts, DirtyLog, DirtyLogLayout, RegionSpec, MAX_REGIONS};

mod mmap;
pub use mmap::PAGE_SIZE;

pub mod msr;
pub use msr::{Msr, RegisterFile, RtitCtl, RtitHardware, RtitStatus};

pub mod topa;

pub mod trace;
pub use trace::{GuestWindow, TraceEngine, TraceState, MAX_ADDR_RANGES, MAX_MULTI_CR3};

/// Errors surfaced by the introspection engines
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Operation not valid in the current state
    #[error("operation not valid in the current state")]
    InvalidOperation,

    /// The processor offers no usable trace hardware
    #[error("processor trace not supported on this host")]
    Unsupported,

    /// IP filter range rejected
    #[error("invalid filter range {start:#x}..{end:#x}")]
    InvalidRange {
        /// Requested range start
        start: u64,

        /// Requested range end
        end: u64,
    },

    /// More regions requested than the dirty log tracks
    #[error("{0} regions requested; at most {MAX_REGIONS} supported")]
    TooManyRegions(usize),

    /// Two requested regions intersect
    #[error("requested regions overlap")]
    OverlappingRegions,

    /// Region size is zero or not page aligned
    #[error("bad region size {0:#x}; need a nonzero multiple of {PAGE_SIZE:#x}")]
    BadRegionSize(u64),

    /// The host refused a backing memory allocation
    #[error("backing allocation failed")]
    AllocationFailed(#[source] std::io::Error),
}

/// One VM's worth of introspection state
///
/// Owns the trace engine and the dirty-page log for a single guest. The
/// embedding creates one per VM and drives the trace side from its vcpu
/// loop.
pub struct Session {
    /// Capabilities the session was created with
    pub caps: TraceCapabilities,

    /// The hardware trace engine
    pub trace: TraceEngine,

    /// The dirty-page log
    pub dirty: DirtyLog,
}

impl Session {
    /// Create a session for a host with the given capabilities
    ///
    /// # Errors
    ///
    /// Fails if the host lacks trace support or the trace ring cannot be
    /// allocated
    pub fn new(caps: TraceCapabilities) -> Result<Self> {
        let trace = TraceEngine::new(caps).context("failed to create trace engine")?;

        Ok(Self {
            caps,
            trace,
            dirty: DirtyLog::new(),
        })
    }
}
