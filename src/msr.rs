//! Processor trace model specific registers and control bits

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Model specific registers touched by the trace engine
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Msr {
    /// Global Performance Counter Status (RO)
    Ia32PerfGlobalStatus = 0x38e,

    /// Reporting Register of Miscellaneous VMX Capabilities (R/O)
    ///
    /// Bit 14 reports whether VMX operation is allowed while processor trace
    /// is active.
    Ia32VmxMisc = 0x485,

    /// Trace Output Base Register (R/W)
    ///
    /// Base physical address of the current ToPA table.
    Ia32RtitOutputBase = 0x560,

    /// Trace Output Mask Pointers Register (R/W)
    ///
    /// Bits 31:7 select the current ToPA table entry; bits 63:32 hold the
    /// output offset within the extent that entry points to.
    Ia32RtitOutputMaskPtrs = 0x561,

    /// Trace Control Register (R/W)
    ///
    /// See [`RtitCtl`] for the individual control bits.
    Ia32RtitCtl = 0x570,

    /// Tracing Status Register (R/W)
    ///
    /// See [`RtitStatus`].
    Ia32RtitStatus = 0x571,

    /// Trace Filter CR3 Match Register (R/W)
    Ia32RtitCr3Match = 0x572,

    /// Region 0 Start Address (R/W)
    Ia32RtitAddr0A = 0x580,

    /// Region 0 End Address (R/W)
    Ia32RtitAddr0B = 0x581,

    /// Region 1 Start Address (R/W)
    Ia32RtitAddr1A = 0x582,

    /// Region 1 End Address (R/W)
    Ia32RtitAddr1B = 0x583,

    /// Region 2 Start Address (R/W)
    Ia32RtitAddr2A = 0x584,

    /// Region 2 End Address (R/W)
    Ia32RtitAddr2B = 0x585,

    /// Region 3 Start Address (R/W)
    Ia32RtitAddr3A = 0x586,

    /// Region 3 End Address (R/W)
    Ia32RtitAddr3B = 0x587,
}

impl Msr {
    /// The `(start, end)` address-range MSR pair for IP filter range `n`
    ///
    /// # Panics
    ///
    /// * If `n` is not a valid range index (0..=3)
    #[must_use]
    pub fn addr_range(n: usize) -> (Msr, Msr) {
        match n {
            0 => (Msr::Ia32RtitAddr0A, Msr::Ia32RtitAddr0B),
            1 => (Msr::Ia32RtitAddr1A, Msr::Ia32RtitAddr1B),
            2 => (Msr::Ia32RtitAddr2A, Msr::Ia32RtitAddr2B),
            3 => (Msr::Ia32RtitAddr3A, Msr::Ia32RtitAddr3B),
            _ => panic!("invalid address range index: {n}"),
        }
    }
}

bitflags::bitflags! {
    /// Control bits of `IA32_RTIT_CTL`
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RtitCtl: u64 {
        /// Master tracing enable
        const TRACE_EN   = 1 << 0;

        /// Enable CYC packet generation
        const CYC_EN     = 1 << 1;

        /// Trace when CPL == 0
        const OS         = 1 << 2;

        /// Trace when CPL > 0
        const USER       = 1 << 3;

        /// Restrict tracing to the address space selected by CR3_MATCH
        const CR3_FILTER = 1 << 7;

        /// Route output through a ToPA table
        const TOPA       = 1 << 8;

        /// Enable MTC timing packets
        const MTC_EN     = 1 << 9;

        /// Enable TSC timing packets
        const TSC_EN     = 1 << 10;

        /// Disable RET compression
        const DIS_RETC   = 1 << 11;

        /// Enable COFI-based packet generation
        const BRANCH_EN  = 1 << 13;

        /// IP filter range 0 enable (ADDR0_CFG = 1)
        const ADDR0_EN   = 1 << 32;

        /// IP filter range 1 enable (ADDR1_CFG = 1)
        const ADDR1_EN   = 1 << 36;

        /// IP filter range 2 enable (ADDR2_CFG = 1)
        const ADDR2_EN   = 1 << 40;

        /// IP filter range 3 enable (ADDR3_CFG = 1)
        const ADDR3_EN   = 1 << 44;
    }
}

impl RtitCtl {
    /// Control value installed at engine creation: kernel and user tracing
    /// through a ToPA table, branch packets only, RET compression off. The
    /// master enable bit stays clear until the enable transition is applied.
    #[must_use]
    pub fn setup_value() -> Self {
        RtitCtl::OS | RtitCtl::USER | RtitCtl::TOPA | RtitCtl::BRANCH_EN | RtitCtl::DIS_RETC
    }

    /// The enable flag for IP filter range `n`
    ///
    /// # Panics
    ///
    /// * If `n` is not a valid range index (0..=3)
    #[must_use]
    pub fn addr_en(n: usize) -> Self {
        match n {
            0 => RtitCtl::ADDR0_EN,
            1 => RtitCtl::ADDR1_EN,
            2 => RtitCtl::ADDR2_EN,
            3 => RtitCtl::ADDR3_EN,
            _ => panic!("invalid address range index: {n}"),
        }
    }
}

bitflags::bitflags! {
    /// Status bits of `IA32_RTIT_STATUS`
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RtitStatus: u64 {
        /// IP filtering is currently engaged
        const FILTER_EN  = 1 << 0;

        /// Tracing is allowed in the current context
        const CONTEXT_EN = 1 << 1;

        /// Tracing is currently generating packets
        const TRIGGER_EN = 1 << 3;

        /// An operational error occurred; tracing was shut down
        const ERROR      = 1 << 4;

        /// Tracing stopped due to a ToPA STOP entry filling up
        const STOPPED    = 1 << 5;
    }
}

/// Mask that clears the PacketByteCnt field (bits 48:32) of `IA32_RTIT_STATUS`
pub const RTIT_STATUS_PACKET_BYTE_CNT_CLEAR: u64 = 0xFFFE_0000_FFFF_FFFF;

/// Bit of `IA32_VMX_MISC` reporting that VMX operation may coexist with an
/// active processor trace
pub const VMX_MISC_PT_IN_VMX: u64 = 1 << 14;

/// Register access the hosting virtualization platform must supply.
///
/// The engine never issues `rdmsr`/`wrmsr` itself: every hardware access goes
/// through this trait so the platform can route it to the physical core the
/// vCPU currently runs on, and so the engine is exercisable under test with a
/// mock register file.
pub trait RtitHardware {
    /// Read the current value of `msr`
    fn read(&mut self, msr: Msr) -> u64;

    /// Write `value` into `msr`
    fn write(&mut self, msr: Msr, value: u64);

    /// Install the VM-entry/exit switch for `IA32_RTIT_CTL`: the guest runs
    /// with `guest` (TRACE_EN set), the host with `host` (TRACE_EN clear).
    fn set_ctl_switch(&mut self, guest: u64, host: u64);

    /// Remove the `IA32_RTIT_CTL` switch, leaving `host` (TRACE_EN clear) in
    /// place for both sides.
    fn clear_ctl_switch(&mut self, host: u64);
}

/// A plain in-memory [`RtitHardware`] implementation.
///
/// Useful for exercising the engine without ring-0 privileges and as the
/// register file of test harnesses. Reads of never-written registers
/// return 0.
#[derive(Debug, Default)]
pub struct RegisterFile {
    /// Backing register values
    regs: std::collections::BTreeMap<u32, u64>,

    /// The installed `(guest, host)` control switch, if any
    pub ctl_switch: Option<(u64, u64)>,
}

impl RtitHardware for RegisterFile {
    fn read(&mut self, msr: Msr) -> u64 {
        self.regs.get(&u32::from(msr)).copied().unwrap_or(0)
    }

    fn write(&mut self, msr: Msr, value: u64) {
        self.regs.insert(u32::from(msr), value);
    }

    fn set_ctl_switch(&mut self, guest: u64, host: u64) {
        self.ctl_switch = Some((guest, host));
    }

    fn clear_ctl_switch(&mut self, host: u64) {
        self.ctl_switch = None;
        self.regs.insert(u32::from(Msr::Ia32RtitCtl), host);
    }
}
