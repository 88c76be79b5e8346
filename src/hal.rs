//! Host services the core depends on but does not own.
//!
//! Every external collaborator of the core sits behind this trait:
//! access to cell memory through the active second-level mapping,
//! the actual port/MMIO/MSR accesses performed after a permission check
//! passed, raw CPUID for feature masking, the host side of hypercalls, and
//! the cross-core translation-invalidation signal.

use axerrno::AxResult;

use crate::addr::{AccessWidth, GuestPhysAddr, Port};

/// The interfaces the embedding hypervisor must implement.
///
/// Methods take `&self`: an implementation is expected to be a cheap handle
/// (often a ZST) whose state, if any, lives behind its own synchronization.
pub trait AxCellHal {
    /// Read cell memory through the active cell's second-level mapping.
    ///
    /// Fails with `BadAddress` when any part of the range is not mapped for
    /// the cell; the core uses this to walk guest page tables and to fetch
    /// instruction bytes, so "not mapped" must be an error, never a fault.
    fn read_guest_phys(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult;

    /// Perform the port read behind a granted I/O intercept.
    fn pio_read(&self, port: Port, width: AccessWidth) -> AxResult<u64>;

    /// Perform the port write behind a granted I/O intercept.
    fn pio_write(&self, port: Port, width: AccessWidth, value: u64) -> AxResult;

    /// Perform the memory read behind a granted MMIO intercept.
    fn mmio_read(&self, gpa: GuestPhysAddr, width: AccessWidth) -> AxResult<u64>;

    /// Perform the memory write behind a granted MMIO intercept.
    fn mmio_write(&self, gpa: GuestPhysAddr, width: AccessWidth, value: u64) -> AxResult;

    /// Read a hardware MSR on behalf of the guest.
    ///
    /// Only reached for MSRs the cell configuration explicitly grants.
    fn read_msr(&self, msr: u32) -> AxResult<u64>;

    /// Write a hardware MSR on behalf of the guest.
    fn write_msr(&self, msr: u32, value: u64) -> AxResult;

    /// Raw host CPUID, `[eax, ebx, ecx, edx]` for the given leaf/subleaf.
    fn host_cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4];

    /// Apply a validated extended-state mask (XSETBV).
    fn xsetbv(&self, index: u32, value: u64);

    /// Perform a host-mediated hypercall action.
    ///
    /// The set of valid calls and their semantics are defined by the
    /// embedder; the core only enforces the calling convention.
    fn hypercall(&self, nr: u64, args: [u64; 2]) -> AxResult<u64>;

    /// Request a second-level translation flush on every CPU in `cpu_mask`.
    ///
    /// Must return only after every targeted CPU has acknowledged the
    /// flush. The region mapper relies on this as the barrier that makes a
    /// mapping change durable: until the broadcast returns, a targeted CPU
    /// may still be using a stale translation. Delivery must work even
    /// while a target CPU is executing guest code.
    fn broadcast_tlb_flush(&self, cpu_mask: usize);
}
