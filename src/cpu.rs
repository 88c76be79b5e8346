//! Physical CPU lifecycle management.
//!
//! One [`AxPhysCpu`] exists per hardware thread and is owned exclusively
//! by that thread of control; no other CPU reads or writes it. The record
//! drives the core through its lifecycle state machine:
//!
//! ```text
//! Uninitialized → Initialized → VmmActive ⇄ (run/trap loop)
//!                      ↕              ↓
//!                    Parked        Faulted
//! ```
//!
//! An illegal transition is never recovered: the state machine moves to
//! [`CpuState::Faulted`] and the CPU is withdrawn from service, because a
//! core whose lifecycle is inconsistent cannot be trusted to hold the
//! isolation boundary.

use alloc::format;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use log::{debug, error};

use crate::cell::AxCell;
use crate::hal::AxCellHal;
use crate::registry::{CpuRegistry, WakeReason};
use crate::vendor::AxVendorVCpu;

/// Architectural default of IA32_PAT after reset.
pub(crate) const DEFAULT_PAT: u64 = 0x0007_0406_0007_0406;

/// Lifecycle state of one physical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Record exists, per-CPU setup not yet done.
    Uninitialized,
    /// Per-CPU setup done, no cell running.
    Initialized,
    /// A cell is running on this CPU.
    VmmActive,
    /// Deliberately idle, waiting for a wake condition.
    Parked,
    /// Irrecoverable; withdrawn from service.
    Faulted,
}

/// How control came back from guest execution context.
///
/// [`AxPhysCpu::activate`] is a control-flow handoff, not a function call:
/// its normal path never returns per-trap. It returns only when the CPU
/// leaves guest context for good, and this describes why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Guest context was left on request; the CPU is back in
    /// [`CpuState::Initialized`] with no cell attached.
    Deactivated,
    /// A vendor-layer failure occurred; the CPU is [`CpuState::Faulted`]
    /// and withdrawn from service.
    Faulted,
}

/// One physical CPU's virtualization lifecycle record.
pub struct AxPhysCpu<V: AxVendorVCpu, H: AxCellHal> {
    cpu_id: usize,
    state: CpuState,
    vendor: Option<V>,
    hal: H,
    cell: Option<Arc<AxCell<V>>>,
    registry: Arc<CpuRegistry>,
    pub(crate) guest_pat: u64,
}

impl<V: AxVendorVCpu, H: AxCellHal> AxPhysCpu<V, H> {
    /// Creates the record for `cpu_id` and claims its registry entry.
    pub fn new(cpu_id: usize, hal: H, registry: Arc<CpuRegistry>) -> AxResult<Self> {
        registry.claim(cpu_id)?;
        Ok(Self {
            cpu_id,
            state: CpuState::Uninitialized,
            vendor: None,
            hal,
            cell: None,
            registry,
            guest_pat: DEFAULT_PAT,
        })
    }

    /// One-time per-CPU setup; must be called once before any other
    /// operation.
    ///
    /// Fails with `Unsupported` (leaving the record uninitialized) if the
    /// hardware lacks virtualization support.
    pub fn init(&mut self, config: V::CreateConfig) -> AxResult {
        if self.state != CpuState::Uninitialized {
            return ax_err!(BadState, "cpu already initialized");
        }
        let mut vendor = V::new(self.cpu_id, config)?;
        let enabled = vendor.hardware_enable();
        self.vendor = Some(vendor);
        if let Err(e) = enabled {
            self.fault();
            return Err(e);
        }
        self.state = CpuState::Initialized;
        debug!("cpu {}: initialized", self.cpu_id);
        Ok(())
    }

    /// This CPU's identity.
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> CpuState {
        self.state
    }

    /// The cell currently attached to this CPU, if any.
    pub fn cell(&self) -> Option<&Arc<AxCell<V>>> {
        self.cell.as_ref()
    }

    /// The attached cell. Panics if none is attached; only callable from
    /// paths that run after [`AxPhysCpu::activate`] checked for one.
    pub(crate) fn cell_checked(&self) -> Arc<AxCell<V>> {
        self.cell.clone().expect("no cell attached")
    }

    /// The vendor execution context. Panics if the CPU is uninitialized.
    pub fn vendor(&self) -> &V {
        self.vendor.as_ref().expect("cpu not initialized")
    }

    /// The mutable vendor execution context. Panics if the CPU is
    /// uninitialized.
    pub fn vendor_mut(&mut self) -> &mut V {
        self.vendor.as_mut().expect("cpu not initialized")
    }

    /// The host services handle.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub(crate) fn registry(&self) -> &CpuRegistry {
        &self.registry
    }

    /// Attaches a cell to this CPU and binds the cell's second-level
    /// translation root into the vendor context.
    ///
    /// At most one cell runs on a CPU at a time.
    pub fn attach_cell(&mut self, cell: &Arc<AxCell<V>>) -> AxResult {
        if self.state != CpuState::Initialized {
            return ax_err!(BadState, "cpu not ready for a cell");
        }
        if self.cell.is_some() {
            return ax_err!(BadState, "a cell is already attached");
        }
        let vendor = self.vendor.as_mut().expect("cpu not initialized");
        cell.with_vendor_state(|state| vendor.bind_cell(state))?;
        cell.attach_cpu(self.cpu_id);
        self.cell = Some(cell.clone());
        debug!("cpu {}: attached to cell \"{}\"", self.cpu_id, cell.name());
        Ok(())
    }

    /// Detaches the current cell without entering guest context (teardown
    /// of a never-activated assignment).
    pub fn detach_cell(&mut self) -> AxResult {
        if self.state != CpuState::Initialized {
            return ax_err!(BadState, "cpu is running or faulted");
        }
        match self.cell.take() {
            Some(cell) => {
                cell.detach_cpu(self.cpu_id);
                Ok(())
            }
            None => ax_err!(BadState, "no cell attached"),
        }
    }

    /// Places the CPU in a low-power wait state until a wake condition is
    /// posted (new cell assignment or host-wide shutdown).
    pub fn park(&mut self) -> AxResult<WakeReason> {
        if self.cell.is_some() {
            return ax_err!(BadState, "cannot park while a cell is attached");
        }
        self.transition(CpuState::Initialized, CpuState::Parked)?;
        debug!("cpu {}: parked", self.cpu_id);
        let reason = self.registry.wait_for_wake(self.cpu_id);
        self.transition(CpuState::Parked, CpuState::Initialized)?;
        debug!("cpu {}: woken ({:?})", self.cpu_id, reason);
        Ok(reason)
    }

    /// Re-initializes the attached cell's execution state on this CPU.
    ///
    /// `hard` additionally clears all partition-visible architectural
    /// state; a soft reset (partition-requested reboot) preserves
    /// configured memory contents.
    pub fn reset_cell(&mut self, hard: bool) {
        if hard {
            self.guest_pat = DEFAULT_PAT;
        }
        self.vendor_mut().reset(hard);
    }

    /// Moves the state machine, failing safe on a mismatch: the CPU goes
    /// to [`CpuState::Faulted`] and is withdrawn rather than continue with
    /// an inconsistent lifecycle.
    pub(crate) fn transition(&mut self, from: CpuState, to: CpuState) -> AxResult {
        if self.state != from {
            let observed = self.state;
            self.fault();
            return ax_err!(
                BadState,
                format!("cpu state is {observed:?}, expected {from:?}")
            );
        }
        self.state = to;
        Ok(())
    }

    /// Withdraws this CPU from service.
    pub(crate) fn fault(&mut self) {
        error!("cpu {}: faulted, withdrawing from service", self.cpu_id);
        self.state = CpuState::Faulted;
        self.registry.withdraw(self.cpu_id);
    }

    pub(crate) fn take_cell(&mut self) -> Option<Arc<AxCell<V>>> {
        self.cell.take()
    }
}

impl<V: AxVendorVCpu, H: AxCellHal> Drop for AxPhysCpu<V, H> {
    fn drop(&mut self) {
        if let Some(vendor) = self.vendor.as_mut() {
            if vendor.is_enabled() {
                let _ = vendor.hardware_disable();
            }
        }
    }
}
