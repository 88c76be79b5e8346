//! Trap classification types.
//!
//! Every hardware-forced transfer of control out of guest execution is
//! reported by the vendor backend as an [`AxExitReason`]. The exit
//! dispatcher turns a reason into an [`InterceptDetail`] by pulling the
//! per-class payload from the vendor, then routes it to the matching
//! handler. Both enums are deliberately closed (no `#[non_exhaustive]`):
//! adding a trap class must break every `match` over them, so a new class
//! can never silently fall through to "resume guest".

use crate::addr::{AccessWidth, GuestPhysAddr, Port};

/// The raw class of the current trap, as reported by the vendor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxExitReason {
    /// A port I/O instruction was intercepted.
    Io,
    /// A guest-physical memory access missed or violated the second-level
    /// translation.
    Mmio,
    /// RDMSR.
    MsrRead,
    /// WRMSR.
    MsrWrite,
    /// CPUID.
    Cpuid,
    /// An explicit hypercall instruction.
    Hypercall,
    /// XSETBV.
    Xsetbv,
    /// Any exit reason this core does not understand. The raw hardware
    /// reason code is carried for the log; the dispatcher fails closed.
    Unknown(u64),
}

/// Per-class detail of an I/O port intercept.
///
/// Populated fresh by the vendor backend on each exit, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct IoIntercept {
    /// The accessed port.
    pub port: Port,
    /// The access width.
    pub width: AccessWidth,
    /// `true` for IN, `false` for OUT.
    pub is_in: bool,
    /// Length of the trapping instruction in bytes, as reported by
    /// hardware. Used to skip the instruction after emulation.
    pub inst_len: u8,
    /// Set for REP-prefixed or string forms (INS/OUTS), which this core
    /// refuses to emulate.
    pub rep_or_str: bool,
}

/// Per-class detail of an MMIO intercept.
#[derive(Debug, Clone, Copy)]
pub struct MmioIntercept {
    /// The guest-physical address of the faulting access.
    pub gpa: GuestPhysAddr,
    /// `true` if the access was a write.
    pub is_write: bool,
}

/// The fully-classified intercept, one variant per trapped operation class.
///
/// CPUID, MSR, hypercall and XSETBV intercepts carry no payload beyond the
/// [`ExecutionState`] snapshot and the guest general-purpose registers
/// owned by the vendor context.
#[derive(Debug, Clone, Copy)]
pub enum InterceptDetail {
    /// Port I/O access.
    IoAccess(IoIntercept),
    /// Memory-mapped I/O access.
    MmioAccess(MmioIntercept),
    /// MSR read.
    MsrRead,
    /// MSR write.
    MsrWrite,
    /// CPUID query.
    Cpuid,
    /// Explicit hypercall.
    Hypercall,
    /// Extended-state mask update.
    Xsetbv,
}

/// Guest execution state as observed by hardware at the moment of trap.
///
/// A read-only snapshot supplied per exit; mutation of guest state goes
/// through the vendor backend, never through this struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionState {
    /// Guest IA32_EFER.
    pub efer: u64,
    /// Guest RFLAGS.
    pub rflags: u64,
    /// Guest code-segment selector.
    pub cs: u16,
    /// Guest instruction pointer.
    pub rip: u64,
}
