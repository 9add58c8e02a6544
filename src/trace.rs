//! Trace configuration/enable state machine and the VM entry/exit hooks
//!
//! Configuration (IP filter ranges, CR3 filters) is mutable only while the
//! engine is idle. An enable or disable request never touches hardware
//! directly: it marks a single pending transition that the entry hook applies
//! at the next VM entry, the only synchronization point where the vCPU, the
//! control surface, and the physical core are known to agree.
//!
//! While tracing is armed, the per-vCPU spin lock is held from entry to the
//! matching exit. Control calls take the same lock and therefore spin for at
//! most one guest slice; the lock is never a sleeping primitive because the
//! hooks run in contexts that must not block.

use std::sync::atomic::{fence, Ordering};

use spin::{Mutex, MutexGuard};

use crate::caps::TraceCapabilities;
use crate::msr::{Msr, RtitCtl, RtitHardware, RtitStatus, RTIT_STATUS_PACKET_BYTE_CNT_CLEAR};
use crate::topa::TopaRing;
use crate::Error;

/// Number of IP filter ranges the register file can hold
pub const MAX_ADDR_RANGES: usize = 4;

/// Number of CR3 values a multi-CR3 filter can hold
pub const MAX_MULTI_CR3: usize = 4;

/// First non-canonical address on 48-bit hardware
const ADDR_HOLE_START: u64 = 0x0000_8000_0000_0000;

/// First canonical address above the hole
const ADDR_HOLE_END: u64 = 0xffff_8000_0000_0000;

/// An IP filter range is usable only if it is non-empty and neither endpoint
/// falls into the non-canonical hole
fn range_check(start: u64, end: u64) -> bool {
    if start >= end {
        return false;
    }

    if (ADDR_HOLE_START..ADDR_HOLE_END).contains(&start) {
        return false;
    }

    if (ADDR_HOLE_START..ADDR_HOLE_END).contains(&end) {
        return false;
    }

    true
}

/// Observable state of the enable state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TraceState {
    /// Filters and CR3 configuration are mutable; no trace output
    Idle,

    /// An enable request is waiting for the next VM entry
    EnablePending,

    /// Tracing is armed; configuration is locked
    Tracing,

    /// A disable request is waiting for the next VM entry
    DisablePending,
}

/// One IP filter range
#[derive(Debug, Copy, Clone, Default)]
struct IpFilterRange {
    /// Range start (inclusive)
    start: u64,

    /// Range end
    end: u64,

    /// Whether the range has been configured with a valid pair
    configured: bool,
}

/// State guarded by the per-vCPU lock
struct TraceInner {
    /// Software copy of the `IA32_RTIT_CTL` control bits (TRACE_EN stays
    /// clear; the guest-side value of the entry switch sets it)
    ctl: RtitCtl,

    /// IP filter ranges
    ranges: [IpFilterRange; MAX_ADDR_RANGES],

    /// Single CR3 match value (zero = unset)
    cr3_match: u64,

    /// Multi-CR3 match values
    multi_cr3: [u64; MAX_MULTI_CR3],

    /// Number of valid multi-CR3 entries
    multi_cr3_num: u8,

    /// Multi-CR3 filtering requested (mutually exclusive with `CR3_FILTER`)
    multi_cr3_enabled: bool,

    /// The two-extent output ring and the mirrored output registers
    topa: TopaRing,

    /// Configuration is locked and the entry switch is installed
    configured: bool,

    /// Desired state of the pending transition (true = enable)
    state: bool,

    /// A transition is waiting to be applied at the next VM entry. At most
    /// one transition can be pending.
    state_change_pending: bool,

    /// Physical core the trace was last active on
    core_id: Option<u32>,
}

impl TraceInner {
    /// Apply a pending enable: lock configuration and install the entry
    /// switch so the guest runs with TRACE_EN and the host without
    fn apply_enable<H: RtitHardware>(&mut self, hw: &mut H) {
        if self.configured {
            return;
        }

        self.configured = true;

        let host = self.ctl.bits() & !RtitCtl::TRACE_EN.bits();
        hw.set_ctl_switch(host | RtitCtl::TRACE_EN.bits(), host);
    }

    /// Apply a pending disable: remove the entry switch, unlock
    /// configuration, and truncate the output ring
    fn apply_disable<H: RtitHardware>(&mut self, hw: &mut H) {
        if !self.configured {
            return;
        }

        self.configured = false;
        hw.clear_ctl_switch(self.ctl.bits() & !RtitCtl::TRACE_EN.bits());

        // Publish the final register mirror before truncating
        fence(Ordering::SeqCst);
        self.topa.reset();
    }

    /// Rewrite every filter/CR3/ToPA register from the software copy.
    ///
    /// Hardware state is not assumed to survive a migration of the vCPU to
    /// another physical core, so this runs unconditionally on every entry.
    fn reconfigure<H: RtitHardware>(&mut self, hw: &mut H) {
        let mut status = hw.read(Msr::Ia32RtitStatus);
        let flags = RtitStatus::from_bits_truncate(status);

        // Stop/error conditions are corrected in place; the guest itself is
        // unaffected, so neither is fatal
        if flags.contains(RtitStatus::STOPPED) {
            log::debug!("Trace stop condition latched; clearing");
            status &= !RtitStatus::STOPPED.bits();
        }
        if flags.contains(RtitStatus::ERROR) {
            log::warn!("Trace error latched; clearing");
            status &= !RtitStatus::ERROR.bits();
        }

        // Restart the packet byte count for the new slice
        status &= RTIT_STATUS_PACKET_BYTE_CNT_CLEAR;
        hw.write(Msr::Ia32RtitStatus, status);

        if self.cr3_match != 0 {
            hw.write(Msr::Ia32RtitCr3Match, self.cr3_match);
        }

        for (n, range) in self.ranges.iter().enumerate() {
            if range.configured {
                let (start_msr, end_msr) = Msr::addr_range(n);
                hw.write(start_msr, range.start);
                hw.write(end_msr, range.end);
            }
        }

        hw.write(Msr::Ia32RtitOutputBase, self.topa.output_base);
        hw.write(Msr::Ia32RtitOutputMaskPtrs, self.topa.output_mask_ptrs);
    }

    /// Read the hardware output registers back into the software copy at the
    /// end of a guest slice
    fn readback<H: RtitHardware>(&mut self, hw: &mut H, core_id: u32) {
        // A core change while the lock was held means the scheduler migrated
        // the vCPU mid-slice, which the locking discipline forbids
        if self.core_id != Some(core_id) {
            log::error!(
                "vCPU migrated across physical cores while tracing: {:?} != {core_id}",
                self.core_id
            );
        }

        let status = RtitStatus::from_bits_truncate(hw.read(Msr::Ia32RtitStatus));
        if status.contains(RtitStatus::STOPPED) {
            log::error!("Trace stopped during guest slice (fallback extent filled)");
        }
        if status.contains(RtitStatus::ERROR) {
            log::error!("Trace error during guest slice");
        }

        self.topa.output_base = hw.read(Msr::Ia32RtitOutputBase);
        self.topa.output_mask_ptrs = hw.read(Msr::Ia32RtitOutputMaskPtrs);
    }
}

/// Per-vCPU trace engine: filter/CR3 configuration, the enable state
/// machine, and the two-extent output ring
pub struct TraceEngine {
    /// Hardware capabilities, probed once at load time
    caps: TraceCapabilities,

    /// Lock spanning the guest execution window; also serializes control
    /// surface mutation against the hardware-visible window
    inner: Mutex<TraceInner>,

    /// Raw parts of the main extent, for buffer views taken while the lock
    /// is held elsewhere
    main_view: (*const u8, usize),

    /// Raw parts of the fallback extent
    fallback_view: (*const u8, usize),
}

// The raw view pointers alias memory owned by `inner`; they are valid for
// the lifetime of the engine and only ever read through them.
unsafe impl Send for TraceEngine {}
unsafe impl Sync for TraceEngine {}

impl TraceEngine {
    /// Create the engine for one vCPU: allocate the ToPA ring and set the
    /// default control value (tracing off)
    ///
    /// # Errors
    ///
    /// * [`Error::Unsupported`] if the capability probe found no usable
    ///   trace hardware
    /// * [`Error::AllocationFailed`] if the ring allocation fails
    pub fn new(caps: TraceCapabilities) -> Result<Self, Error> {
        if !caps.trace_supported {
            return Err(Error::Unsupported);
        }

        let topa = TopaRing::new()?;
        let main_view = topa.main_raw_parts();
        let fallback_view = topa.fallback_raw_parts();

        Ok(Self {
            caps,
            inner: Mutex::new(TraceInner {
                ctl: RtitCtl::setup_value(),
                ranges: [IpFilterRange::default(); MAX_ADDR_RANGES],
                cr3_match: 0,
                multi_cr3: [0; MAX_MULTI_CR3],
                multi_cr3_num: 0,
                multi_cr3_enabled: false,
                topa,
                configured: false,
                state: false,
                state_change_pending: false,
                core_id: None,
            }),
            main_view,
            fallback_view,
        })
    }

    /// Current state of the enable state machine
    #[must_use]
    pub fn state(&self) -> TraceState {
        let inner = self.inner.lock();
        match (inner.configured, inner.state_change_pending) {
            (false, false) => TraceState::Idle,
            (false, true) => TraceState::EnablePending,
            (true, false) => TraceState::Tracing,
            (true, true) => TraceState::DisablePending,
        }
    }

    /// Configure IP filter range `n`
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while configuration is locked or if the
    ///   hardware implements fewer than `n + 1` ranges
    /// * [`Error::InvalidRange`] if the range is empty, inverted, or touches
    ///   the non-canonical hole
    pub fn configure_filter(&self, n: usize, start: u64, end: u64) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        // The capability record is caller-supplied and may report more
        // ranges than the register file carries
        if inner.configured
            || n >= MAX_ADDR_RANGES
            || n >= usize::from(self.caps.addr_range_count)
        {
            return Err(Error::InvalidOperation);
        }

        if !range_check(start, end) {
            log::warn!("IP filter range {n} rejected: {start:#x}..{end:#x}");
            return Err(Error::InvalidRange { start, end });
        }

        inner.ranges[n] = IpFilterRange {
            start,
            end,
            configured: true,
        };

        Ok(0)
    }

    /// Enable IP filter range `n`; the range must have been configured
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked, beyond the hardware range
    ///   count, or if the range was never configured
    pub fn enable_filter(&self, n: usize) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured
            || n >= MAX_ADDR_RANGES
            || n >= usize::from(self.caps.addr_range_count)
            || !inner.ranges[n].configured
        {
            return Err(Error::InvalidOperation);
        }

        inner.ctl |= RtitCtl::addr_en(n);
        Ok(0)
    }

    /// Disable IP filter range `n`
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked or if the range is not
    ///   currently enabled
    pub fn disable_filter(&self, n: usize) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || n >= MAX_ADDR_RANGES || !inner.ctl.contains(RtitCtl::addr_en(n)) {
            return Err(Error::InvalidOperation);
        }

        inner.ctl &= !RtitCtl::addr_en(n);
        Ok(0)
    }

    /// Set the CR3 match value for single address-space filtering
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while configuration is locked
    pub fn configure_cr3(&self, value: u64) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured {
            return Err(Error::InvalidOperation);
        }

        inner.cr3_match = value;
        Ok(0)
    }

    /// Enable CR3 filtering. A zero match value is treated as unset, and
    /// multi-CR3 mode must not be active.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked, with no match value, or
    ///   with multi-CR3 filtering enabled
    pub fn enable_cr3(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || inner.cr3_match == 0 || inner.multi_cr3_enabled {
            return Err(Error::InvalidOperation);
        }

        inner.ctl |= RtitCtl::CR3_FILTER;
        Ok(0)
    }

    /// Disable CR3 filtering
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked or if not enabled
    pub fn disable_cr3(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || !inner.ctl.contains(RtitCtl::CR3_FILTER) {
            return Err(Error::InvalidOperation);
        }

        inner.ctl &= !RtitCtl::CR3_FILTER;
        Ok(0)
    }

    /// Configure up to [`MAX_MULTI_CR3`] match values for multi address-space
    /// filtering
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked or with more than
    ///   [`MAX_MULTI_CR3`] values
    pub fn configure_multi_cr3(&self, values: &[u64]) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || values.len() > MAX_MULTI_CR3 {
            return Err(Error::InvalidOperation);
        }

        inner.multi_cr3 = [0; MAX_MULTI_CR3];
        inner.multi_cr3[..values.len()].copy_from_slice(values);
        inner.multi_cr3_num = values.len() as u8;
        Ok(0)
    }

    /// Enable multi-CR3 filtering; mutually exclusive with the single CR3
    /// filter
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked, with no configured
    ///   values, with the single CR3 filter enabled, or if already enabled
    pub fn enable_multi_cr3(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured
            || inner.ctl.contains(RtitCtl::CR3_FILTER)
            || inner.multi_cr3_num == 0
            || inner.multi_cr3_enabled
        {
            return Err(Error::InvalidOperation);
        }

        inner.multi_cr3_enabled = true;
        Ok(0)
    }

    /// Disable multi-CR3 filtering
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] while locked or if not enabled
    pub fn disable_multi_cr3(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || !inner.multi_cr3_enabled {
            return Err(Error::InvalidOperation);
        }

        inner.multi_cr3_enabled = false;
        Ok(0)
    }

    /// The active multi-CR3 match set, for the platform's address-space
    /// switch handling. `None` unless tracing is armed with multi-CR3
    /// filtering enabled.
    #[must_use]
    pub fn multi_cr3_filter(&self) -> Option<([u64; MAX_MULTI_CR3], u8)> {
        let inner = self.inner.lock();

        if inner.configured && inner.multi_cr3_enabled {
            Some((inner.multi_cr3, inner.multi_cr3_num))
        } else {
            None
        }
    }

    /// Request tracing to start. Returns immediately; the transition is
    /// applied at the next VM entry.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] if tracing is already armed or another
    ///   transition is pending
    pub fn enable(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if inner.configured || inner.state_change_pending {
            return Err(Error::InvalidOperation);
        }

        inner.state = true;
        inner.state_change_pending = true;
        Ok(0)
    }

    /// Request tracing to stop. Returns the logical trace size captured at
    /// request time; the teardown and the destructive ring reset are applied
    /// at the next VM entry.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidOperation`] if tracing is not armed or another
    ///   transition is pending
    pub fn disable(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();

        if !inner.configured || inner.state_change_pending {
            return Err(Error::InvalidOperation);
        }

        let bytes = inner.topa.current_size();

        inner.state = false;
        inner.state_change_pending = true;
        Ok(bytes)
    }

    /// Check whether the main extent has filled; if so the ring is reset
    /// (destructively) and the pre-reset logical size is returned, otherwise
    /// 0. Idempotent when no new data has arrived.
    pub fn check_overflow(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();
        Ok(inner.topa.check_overflow())
    }

    /// Total number of mappable trace bytes (main plus fallback extent)
    pub fn buffer_size(&self) -> Result<u64, Error> {
        let inner = self.inner.lock();
        Ok(inner.topa.buffer_size())
    }

    /// Read-only view of the main extent, for the zero-copy trace mapping.
    ///
    /// Concurrent guest slices write into this memory; a reader gets no
    /// snapshot consistency. The terminal marker byte stamped by the size
    /// computation bounds the meaningful data.
    #[must_use]
    pub fn main_buffer(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.main_view.0, self.main_view.1) }
    }

    /// Read-only view of the fallback extent. The two extents are
    /// independent mappings, not necessarily physically contiguous.
    #[must_use]
    pub fn fallback_buffer(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.fallback_view.0, self.fallback_view.1) }
    }

    /// VM entry hook. Must be called immediately before every guest slice.
    ///
    /// Applies a pending enable/disable transition, and if tracing is armed,
    /// reprograms every trace register from the software copy and returns a
    /// [`GuestWindow`] holding the per-vCPU lock. The platform runs the guest
    /// slice while holding the window and hands it back to
    /// [`GuestWindow::vmexit`] afterwards.
    ///
    /// Returns `None` when tracing is not armed (nothing to program, no lock
    /// to hold).
    pub fn vmentry<'a, H: RtitHardware>(
        &'a self,
        hw: &mut H,
        core_id: u32,
    ) -> Option<GuestWindow<'a>> {
        let mut inner = self.inner.lock();

        // The entry hook is the sole application point of the two-phase
        // enable/disable commit
        if inner.state_change_pending {
            if inner.state {
                inner.apply_enable(hw);
            } else {
                inner.apply_disable(hw);
            }
            inner.state_change_pending = false;
        }

        if !inner.configured {
            return None;
        }

        inner.core_id = Some(core_id);
        inner.reconfigure(hw);

        Some(GuestWindow { inner })
    }
}

/// The per-vCPU lock, held for the span of one guest execution slice.
///
/// Obtained from [`TraceEngine::vmentry`]; consumed by
/// [`GuestWindow::vmexit`]. Dropping the window without calling `vmexit`
/// releases the lock but leaves the software register copy stale, so the
/// platform should only do that when abandoning the slice.
pub struct GuestWindow<'a> {
    /// The guard spanning entry to exit
    inner: MutexGuard<'a, TraceInner>,
}

impl GuestWindow<'_> {
    /// VM exit hook. Must be called immediately after the guest slice.
    ///
    /// Verifies the physical core did not change under the lock, reads the
    /// hardware output registers back into the software copy, and issues a
    /// full barrier before releasing the lock. The barrier-then-release
    /// sequence is the sole point publishing the fresh copy to concurrent
    /// mapped readers.
    pub fn vmexit<H: RtitHardware>(mut self, hw: &mut H, core_id: u32) {
        self.inner.readback(hw, core_id);
        fence(Ordering::SeqCst);

        // Dropping `self` releases the per-vCPU lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::RegisterFile;

    fn engine() -> TraceEngine {
        TraceEngine::new(TraceCapabilities::new(true, 4)).unwrap()
    }

    /// Drive one empty guest slice through the entry/exit hooks
    fn run_slice(engine: &TraceEngine, hw: &mut RegisterFile, core: u32) {
        if let Some(window) = engine.vmentry(hw, core) {
            window.vmexit(hw, core);
        }
    }

    #[test]
    fn unsupported_hardware_refuses_engine() {
        let res = TraceEngine::new(TraceCapabilities::unsupported());
        assert!(matches!(res, Err(Error::Unsupported)));
    }

    #[test]
    fn valid_ranges_accepted() {
        let engine = engine();

        assert!(engine.configure_filter(0, 0x1000, 0x2000).is_ok());
        assert!(engine.enable_filter(0).is_ok());

        // High canonical half is fine too
        assert!(engine
            .configure_filter(1, 0xffff_8000_0000_1000, 0xffff_8000_0000_2000)
            .is_ok());
    }

    #[test]
    fn invalid_ranges_rejected() {
        let engine = engine();

        // Empty and inverted
        assert!(matches!(
            engine.configure_filter(0, 0x1000, 0x1000),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            engine.configure_filter(0, 0x2000, 0x1000),
            Err(Error::InvalidRange { .. })
        ));

        // Endpoints inside the non-canonical hole
        assert!(engine
            .configure_filter(0, 0x0000_8000_0000_0000, 0xffff_9000_0000_0000)
            .is_err());
        assert!(engine
            .configure_filter(0, 0x1000, 0x0000_8000_0000_0000)
            .is_err());

        // State unchanged: the range was never configured, enabling fails
        assert!(engine.enable_filter(0).is_err());
    }

    #[test]
    fn filter_count_bounded_by_capabilities() {
        let engine = TraceEngine::new(TraceCapabilities::new(true, 2)).unwrap();

        assert!(engine.configure_filter(1, 0x1000, 0x2000).is_ok());
        assert!(matches!(
            engine.configure_filter(2, 0x1000, 0x2000),
            Err(Error::InvalidOperation)
        ));
    }

    #[test]
    fn enable_defers_to_entry() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        assert_eq!(engine.enable().unwrap(), 0);
        assert_eq!(engine.state(), TraceState::EnablePending);

        // A second transition while one is pending is refused
        assert!(engine.enable().is_err());
        assert!(engine.disable().is_err());

        run_slice(&engine, &mut hw, 0);
        assert_eq!(engine.state(), TraceState::Tracing);

        // The guest side of the switch carries TRACE_EN, the host side not
        let (guest, host) = hw.ctl_switch.unwrap();
        assert_ne!(guest & RtitCtl::TRACE_EN.bits(), 0);
        assert_eq!(host & RtitCtl::TRACE_EN.bits(), 0);
    }

    #[test]
    fn configuration_locked_while_tracing() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        engine.configure_filter(0, 0x1000, 0x2000).unwrap();
        engine.enable_filter(0).unwrap();
        engine.enable().unwrap();
        run_slice(&engine, &mut hw, 0);

        assert!(matches!(
            engine.configure_filter(1, 0x3000, 0x4000),
            Err(Error::InvalidOperation)
        ));
        assert!(engine.enable_filter(0).is_err());
        assert!(engine.configure_cr3(0x1234000).is_err());
        assert!(engine.enable().is_err());

        // Disable goes back through the pending state to idle
        engine.disable().unwrap();
        assert_eq!(engine.state(), TraceState::DisablePending);
        run_slice(&engine, &mut hw, 0);
        assert_eq!(engine.state(), TraceState::Idle);
        assert!(hw.ctl_switch.is_none());

        // Unlocked again
        assert!(engine.configure_filter(1, 0x3000, 0x4000).is_ok());
    }

    #[test]
    fn overlong_capability_count_cannot_index_past_ranges() {
        // A caller-supplied record may claim more ranges than the register
        // file carries; indices past the register file are refused, not a
        // panic
        let engine = TraceEngine::new(TraceCapabilities::new(true, 5)).unwrap();

        assert!(matches!(
            engine.configure_filter(4, 0x1000, 0x2000),
            Err(Error::InvalidOperation)
        ));
        assert!(matches!(
            engine.enable_filter(4),
            Err(Error::InvalidOperation)
        ));
        assert!(matches!(
            engine.disable_filter(4),
            Err(Error::InvalidOperation)
        ));

        // Indices the register file does carry still work
        assert!(engine.configure_filter(3, 0x1000, 0x2000).is_ok());
    }

    #[test]
    fn cr3_modes_mutually_exclusive() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        engine.configure_cr3(0x1234000).unwrap();
        engine.configure_multi_cr3(&[0x1000, 0x2000]).unwrap();

        engine.enable_multi_cr3().unwrap();
        assert!(engine.enable_cr3().is_err());

        // The match set is only published while tracing is armed
        assert!(engine.multi_cr3_filter().is_none());
        engine.enable().unwrap();
        run_slice(&engine, &mut hw, 0);
        let (values, num) = engine.multi_cr3_filter().unwrap();
        assert_eq!(num, 2);
        assert_eq!(&values[..2], &[0x1000, 0x2000]);

        engine.disable().unwrap();
        run_slice(&engine, &mut hw, 0);
        assert!(engine.multi_cr3_filter().is_none());

        engine.disable_multi_cr3().unwrap();
        engine.enable_cr3().unwrap();
        assert!(engine.enable_multi_cr3().is_err());
    }

    #[test]
    fn cr3_enable_requires_value() {
        let engine = engine();
        assert!(engine.enable_cr3().is_err());
        assert!(engine.enable_multi_cr3().is_err());
    }

    #[test]
    fn entry_reprograms_registers() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        engine.configure_filter(0, 0x40_0000, 0x50_0000).unwrap();
        engine.enable_filter(0).unwrap();
        engine.configure_cr3(0x1234000).unwrap();
        engine.enable_cr3().unwrap();
        engine.enable().unwrap();

        let window = engine.vmentry(&mut hw, 3).unwrap();

        assert_eq!(hw.read(Msr::Ia32RtitAddr0A), 0x40_0000);
        assert_eq!(hw.read(Msr::Ia32RtitAddr0B), 0x50_0000);
        assert_eq!(hw.read(Msr::Ia32RtitCr3Match), 0x1234000);
        assert_eq!(hw.read(Msr::Ia32RtitOutputMaskPtrs), 0x7f);
        assert_ne!(hw.read(Msr::Ia32RtitOutputBase), 0);

        window.vmexit(&mut hw, 3);
    }

    #[test]
    fn exit_reads_back_output_registers() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        engine.enable().unwrap();
        let window = engine.vmentry(&mut hw, 0).unwrap();

        // The "hardware" advances the output offset during the slice
        hw.write(Msr::Ia32RtitOutputMaskPtrs, (0x800 << 32) | 0x7f);
        window.vmexit(&mut hw, 0);

        // The captured size is visible to the disable path
        assert_eq!(engine.disable().unwrap(), 0x800);
        run_slice(&engine, &mut hw, 0);

        // The teardown truncated the ring
        engine.enable().unwrap();
        run_slice(&engine, &mut hw, 0);
        assert_eq!(engine.disable().unwrap(), 0);
        run_slice(&engine, &mut hw, 0);
    }

    #[test]
    fn overflow_resets_once() {
        let engine = engine();
        let mut hw = RegisterFile::default();

        engine.enable().unwrap();
        let window = engine.vmentry(&mut hw, 0).unwrap();

        // Spill into the fallback extent: entry 1, offset 0x20
        hw.write(
            Msr::Ia32RtitOutputMaskPtrs,
            (0x20 << 32) | (1 << 7) | 0x7f,
        );
        window.vmexit(&mut hw, 0);

        let bytes = engine.check_overflow().unwrap();
        assert_eq!(bytes, crate::topa::TOPA_MAIN_SIZE + 0x20);

        // Idempotent with no new data
        assert_eq!(engine.check_overflow().unwrap(), 0);
    }

    #[test]
    fn no_window_while_idle() {
        let engine = engine();
        let mut hw = RegisterFile::default();
        assert!(engine.vmentry(&mut hw, 0).is_none());
    }
}
