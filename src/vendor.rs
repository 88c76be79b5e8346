//! Vendor backend trait definition.
//!
//! Exactly two hardware virtualization technologies implement this trait,
//! and exactly one of them is selected at host boot. The rest of the crate
//! is generic over the implementation and never branches on vendor
//! identity: everything vendor-specific (VM-entry/exit machinery,
//! second-level translation encoding, I/O-bitmap layout) lives behind this
//! contract.

use axerrno::AxResult;

use crate::cell::{CellConfig, MemoryRegion};
use crate::exit::{AxExitReason, ExecutionState, IoIntercept, MmioIntercept};
use crate::paging::PagingRegisters;

/// Guest general-purpose register indices, in x86 instruction-encoding
/// order (the order ModRM reg fields and the vendor register files use).
pub mod regs {
    /// RAX.
    pub const RAX: usize = 0;
    /// RCX.
    pub const RCX: usize = 1;
    /// RDX.
    pub const RDX: usize = 2;
    /// RBX.
    pub const RBX: usize = 3;
    /// RSP.
    pub const RSP: usize = 4;
    /// RBP.
    pub const RBP: usize = 5;
    /// RSI.
    pub const RSI: usize = 6;
    /// RDI.
    pub const RDI: usize = 7;
}

/// The fixed contract between the vendor-neutral core and one hardware
/// virtualization backend.
///
/// One value of the implementing type exists per physical CPU and holds
/// that CPU's guest execution context. Per-cell vendor state (the
/// second-level translation root and the I/O permission bitmap) is opaque
/// to the core and carried as [`AxVendorVCpu::CellState`].
pub trait AxVendorVCpu: Sized {
    /// Vendor-specific configuration consumed by [`AxVendorVCpu::new`].
    type CreateConfig;

    /// Opaque per-cell state: the second-level translation structures and
    /// the I/O permission bitmap built from the cell configuration.
    type CellState;

    /// One-time per-CPU initialization of the vendor context.
    ///
    /// Fails with `Unsupported` if the hardware lacks the required
    /// virtualization support.
    fn new(cpu_id: usize, config: Self::CreateConfig) -> AxResult<Self>;

    /// Whether hardware virtualization is currently enabled on this CPU.
    fn is_enabled(&self) -> bool;

    /// Enable hardware virtualization on this CPU.
    fn hardware_enable(&mut self) -> AxResult;

    /// Disable hardware virtualization on this CPU.
    fn hardware_disable(&mut self) -> AxResult;

    /// Build the per-cell vendor state from the cell configuration:
    /// construct the second-level translation root and encode the I/O
    /// permission bitmap from the cell's port grants.
    fn cell_init(config: &CellConfig) -> AxResult<Self::CellState>;

    /// Tear down the per-cell vendor state.
    fn cell_exit(state: &mut Self::CellState);

    /// Install second-level translation entries for exactly one region.
    fn map_region(state: &mut Self::CellState, region: &MemoryRegion) -> AxResult;

    /// Remove the second-level translation entries of exactly one region.
    fn unmap_region(state: &mut Self::CellState, region: &MemoryRegion) -> AxResult;

    /// Load a cell's second-level translation root into this CPU's guest
    /// execution context, making the cell the one this CPU runs.
    fn bind_cell(&mut self, state: &Self::CellState) -> AxResult;

    /// Enter guest execution and return on the next trap with its raw
    /// class.
    ///
    /// An `Err` is a vendor-layer failure and is fatal to the calling CPU;
    /// the core withdraws it from service rather than retry.
    fn run(&mut self) -> AxResult<AxExitReason>;

    /// Snapshot of the guest execution state at the current trap.
    fn execution_state(&self) -> AxResult<ExecutionState>;

    /// Per-class detail of the current I/O intercept.
    ///
    /// Only meaningful while handling an [`AxExitReason::Io`] trap.
    fn io_intercept(&self) -> AxResult<IoIntercept>;

    /// Per-class detail of the current MMIO intercept.
    ///
    /// Only meaningful while handling an [`AxExitReason::Mmio`] trap.
    fn mmio_intercept(&self) -> AxResult<MmioIntercept>;

    /// The guest control-register state the paging walker snapshots from.
    fn paging_registers(&self) -> PagingRegisters;

    /// Read a guest general-purpose register (see [`regs`]).
    fn gpr(&self, reg: usize) -> u64;

    /// Write a guest general-purpose register (see [`regs`]).
    fn set_gpr(&mut self, reg: usize, value: u64);

    /// Advance the guest instruction pointer past the trapping instruction.
    ///
    /// Must be applied exactly once per successfully emulated trap:
    /// omission re-traps the same instruction forever, double application
    /// corrupts guest control flow.
    fn skip_instruction(&mut self, len: u8);

    /// Program the guest PAT as seen by hardware.
    fn set_guest_pat(&mut self, value: u64);

    /// Re-initialize the cell's execution state on this CPU.
    ///
    /// A hard reset additionally clears all partition-visible architectural
    /// state; a soft reset preserves configured memory contents.
    fn reset(&mut self, hard: bool);

    /// Unconditionally leave guest execution context on this CPU.
    fn deactivate(&mut self);

    /// Flush this CPU's cached second-level translations.
    ///
    /// The receive side of the cross-core invalidation signal; invoked by
    /// the embedder's inter-core interrupt path, which must be deliverable
    /// even while this CPU executes guest code.
    fn tlb_flush(&mut self);
}
