//! Serializable control surface for the trace engine and the dirty-page log
//!
//! The orchestrator drives a session through these commands; each one maps
//! onto exactly one engine operation. Commands are plain data so they can
//! travel over whatever channel the embedding uses.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::dirty::{DirtyCounts, DirtyLog, DirtyLogLayout, RegionSpec};
use crate::trace::TraceEngine;
use crate::Error;

/// Session handle counter; handles are process-unique and never reused
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Commands accepted by the hardware trace engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TraceCommand {
    /// Allocate a fresh session handle
    SetupHandle,

    /// Set IP filter range `n` to trace `[start, end)`
    ConfigureFilter {
        /// Filter range index
        n: usize,

        /// Range start (inclusive)
        start: u64,

        /// Range end
        end: u64,
    },

    /// Arm IP filter range `n`
    EnableFilter(usize),

    /// Disarm IP filter range `n`
    DisableFilter(usize),

    /// Set the CR3 match value
    ConfigureCr3(u64),

    /// Arm the single CR3 filter
    EnableCr3,

    /// Disarm the single CR3 filter
    DisableCr3,

    /// Set the multi-CR3 match set
    ConfigureMultiCr3(Vec<u64>),

    /// Arm multi-CR3 filtering
    EnableMultiCr3,

    /// Disarm multi-CR3 filtering
    DisableMultiCr3,

    /// Request tracing to start at the next VM entry
    Enable,

    /// Request tracing to stop at the next VM entry; replies with the trace
    /// size captured at request time
    Disable,

    /// Poll for main-extent overflow; replies with the pre-reset size or 0
    CheckOverflow,

    /// Reply with the total mappable trace buffer size
    GetBufferSize,
}

/// Commands accepted by the dirty-page log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirtyLogCommand {
    /// One-shot region configuration
    Configure(Vec<RegionSpec>),

    /// Reset every region's log length without reporting it
    Flush,

    /// Report and reset every region's log length
    GetAndResetCounts,
}

/// Replies from the dirty-page log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirtyLogReply {
    /// Layout of the shared bitmap+log allocation
    Configured(DirtyLogLayout),

    /// Acknowledge with no payload
    Done,

    /// Per-region log lengths
    Counts(DirtyCounts),
}

impl TraceEngine {
    /// Dispatch one control command; every reply is a single `u64`
    ///
    /// # Errors
    ///
    /// Forwards the underlying operation's error unchanged
    pub fn handle_command(&self, command: &TraceCommand) -> Result<u64, Error> {
        log::debug!("Trace command: {command:x?}");

        match *command {
            TraceCommand::SetupHandle => Ok(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)),
            TraceCommand::ConfigureFilter { n, start, end } => {
                self.configure_filter(n, start, end)
            }
            TraceCommand::EnableFilter(n) => self.enable_filter(n),
            TraceCommand::DisableFilter(n) => self.disable_filter(n),
            TraceCommand::ConfigureCr3(cr3) => self.configure_cr3(cr3),
            TraceCommand::EnableCr3 => self.enable_cr3(),
            TraceCommand::DisableCr3 => self.disable_cr3(),
            TraceCommand::ConfigureMultiCr3(ref values) => self.configure_multi_cr3(values),
            TraceCommand::EnableMultiCr3 => self.enable_multi_cr3(),
            TraceCommand::DisableMultiCr3 => self.disable_multi_cr3(),
            TraceCommand::Enable => self.enable(),
            TraceCommand::Disable => self.disable(),
            TraceCommand::CheckOverflow => self.check_overflow(),
            TraceCommand::GetBufferSize => self.buffer_size(),
        }
    }
}

impl DirtyLog {
    /// Dispatch one control command
    ///
    /// # Errors
    ///
    /// Forwards the underlying operation's error unchanged
    pub fn handle_command(&self, command: &DirtyLogCommand) -> Result<DirtyLogReply, Error> {
        log::debug!("Dirty log command: {command:x?}");

        match command {
            DirtyLogCommand::Configure(specs) => {
                self.configure(specs).map(DirtyLogReply::Configured)
            }
            DirtyLogCommand::Flush => self.flush().map(|()| DirtyLogReply::Done),
            DirtyLogCommand::GetAndResetCounts => {
                self.read_and_reset().map(DirtyLogReply::Counts)
            }
        }
    }
}
