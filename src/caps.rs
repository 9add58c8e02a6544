//! One-time hardware feature detection for the trace engine

use crate::msr::{Msr, RtitHardware, VMX_MISC_PT_IN_VMX};

/// Immutable capability record computed once at initialization and threaded
/// into every component that needs it.
///
/// All logical cores are assumed to report the same feature set.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TraceCapabilities {
    /// Processor trace with multi-entry ToPA output is usable from guest mode
    pub trace_supported: bool,

    /// Number of IP filter address ranges the hardware implements (0..=4)
    pub addr_range_count: u8,
}

impl TraceCapabilities {
    /// Construct a capability record directly, bypassing the hardware probe.
    /// Used on hosts without CPUID access and by tests.
    #[must_use]
    pub const fn new(trace_supported: bool, addr_range_count: u8) -> Self {
        Self {
            trace_supported,
            addr_range_count,
        }
    }

    /// A record reporting no trace support at all
    #[must_use]
    pub const fn unsupported() -> Self {
        Self::new(false, 0)
    }

    /// Probe the running processor for trace support.
    ///
    /// Requires, on top of baseline processor trace:
    /// * ToPA output with multiple table entries (a single-entry ToPA cannot
    ///   express the main/fallback ring)
    /// * IP filtering
    /// * IP payloads stored as plain IPs, not LIPs
    /// * VMX operation permitted while tracing (`IA32_VMX_MISC[14]`)
    ///
    /// `hw` is only used to read `IA32_VMX_MISC`.
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub fn probe<H: RtitHardware>(hw: &mut H) -> Self {
        use core::arch::x86_64::{__cpuid, __cpuid_count};

        // CPUID leaf 0x14 must exist before any PT enumeration is valid
        let max_leaf = unsafe { __cpuid(0) }.eax;
        if max_leaf < 0x14 {
            log::warn!("No CPUID leaf 0x14; processor trace unavailable");
            return Self::unsupported();
        }

        let feat = unsafe { __cpuid_count(0x7, 0) };
        if feat.ebx & (1 << 25) == 0 {
            log::warn!("CPUID reports no processor trace support");
            return Self::unsupported();
        }

        let pt = unsafe { __cpuid_count(0x14, 0) };

        // ToPA output, with more than one table entry
        if pt.ecx & (1 << 0) == 0 {
            log::warn!("No ToPA output support");
            return Self::unsupported();
        }
        if pt.ecx & (1 << 1) == 0 {
            log::warn!("Only single-entry ToPA tables supported");
            return Self::unsupported();
        }

        // LIP payloads would force the consumer to track segment bases
        if pt.ecx & (1 << 31) != 0 {
            log::warn!("IP payloads are LIP; unsupported");
            return Self::unsupported();
        }

        if pt.ebx & (1 << 2) == 0 {
            log::warn!("No IP filtering support");
            return Self::unsupported();
        }

        let sub = unsafe { __cpuid_count(0x14, 1) };

        // The register file only carries four range pairs; never report more
        // than the engine can address, whatever the hardware enumerates
        let addr_range_count =
            ((sub.eax & 0x7) as u8).min(crate::trace::MAX_ADDR_RANGES as u8);

        // Guest-mode tracing requires the VMX side to allow it
        if hw.read(Msr::Ia32VmxMisc) & VMX_MISC_PT_IN_VMX == 0 {
            log::warn!("VMX operation is not permitted while tracing");
            return Self::unsupported();
        }

        log::info!("Processor trace supported; {addr_range_count} IP filter ranges");

        Self::new(true, addr_range_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_record_reports_nothing() {
        let caps = TraceCapabilities::unsupported();
        assert!(!caps.trace_supported);
        assert_eq!(caps.addr_range_count, 0);
    }
}
