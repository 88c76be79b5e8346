//! Exit dispatcher and intercept handlers.
//!
//! [`AxPhysCpu::activate`] hands the CPU off into guest execution context
//! and re-enters here on every hardware trap. Each trap is classified
//! into exactly one [`InterceptDetail`] and handled to a success/failure
//! verdict with interrupts mostly disabled, never interleaved with other
//! traps. Classification is total by construction: the `match` over the
//! closed exit-reason enum has no wildcard, so an unrecognized trap class
//! cannot compile into "resume guest".
//!
//! Failure policy: a handler failure or an unclassified exit means the
//! guest did something the isolation model does not understand, so the
//! owning cell is hard-reset, never resumed blindly. A vendor-layer
//! failure is fatal to the CPU itself, which is withdrawn from service.

use alloc::format;

use axerrno::{ax_err, AxResult};
use log::{debug, error, warn};

use crate::addr::{AccessWidth, GuestVirtAddr};
use crate::cell::MemFlags;
use crate::cpu::{AxPhysCpu, CpuState, Handoff};
use crate::exit::{AxExitReason, ExecutionState, InterceptDetail, IoIntercept, MmioIntercept};
use crate::hal::AxCellHal;
use crate::inst::{self, MmioOperand, MAX_INST_LEN};
use crate::paging::GuestPagingStructures;
use crate::vendor::{regs, AxVendorVCpu};

const MSR_IA32_PAT: u32 = 0x277;

const EFER_LMA: u64 = 1 << 10;
const CR4_OSXSAVE: u64 = 1 << 18;

const CPUID1_ECX_VMX: u32 = 1 << 5;
const CPUID1_ECX_OSXSAVE: u32 = 1 << 27;
const CPUID1_ECX_HYPERVISOR: u32 = 1 << 31;
const CPUID_EXT1_ECX_SVM: u32 = 1 << 2;
const CPUID_HYPERVISOR_BASE: u32 = 0x4000_0000;

const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

// Fixed lengths of the single-form trapping instructions.
const INST_LEN_CPUID: u8 = 2;
const INST_LEN_RDMSR: u8 = 2;
const INST_LEN_WRMSR: u8 = 2;
const INST_LEN_HYPERCALL: u8 = 3;
const INST_LEN_XSETBV: u8 = 3;

/// Error word returned in RAX for a hypercall issued from a disallowed
/// mode or rejected by the host.
const HYPERCALL_ERROR: u64 = u64::MAX;

impl<V: AxVendorVCpu, H: AxCellHal> AxPhysCpu<V, H> {
    /// Transfers control into guest execution context.
    ///
    /// This is a handoff, not a function call: the normal path loops
    /// between guest execution and trap handling and does not return per
    /// trap. Control comes back only when the CPU leaves guest context
    /// for good, with a [`Handoff`] describing why.
    ///
    /// Requires an attached cell; anything else faults the CPU.
    pub fn activate(&mut self) -> AxResult<Handoff> {
        if self.cell().is_none() {
            self.fault();
            return ax_err!(BadState, "activate without an attached cell");
        }
        self.transition(CpuState::Initialized, CpuState::VmmActive)?;
        debug!("cpu {}: entering guest context", self.cpu_id());

        loop {
            if self.registry().take_deactivate(self.cpu_id()) {
                return self.deactivate();
            }
            let reason = match self.vendor_mut().run() {
                Ok(reason) => reason,
                Err(e) => {
                    error!("cpu {}: vendor run failed: {:?}", self.cpu_id(), e);
                    self.fault();
                    return Ok(Handoff::Faulted);
                }
            };
            let state = match self.vendor().execution_state() {
                Ok(state) => state,
                Err(e) => {
                    error!(
                        "cpu {}: cannot read execution state: {:?}",
                        self.cpu_id(),
                        e
                    );
                    self.fault();
                    return Ok(Handoff::Faulted);
                }
            };
            match self.classify(reason) {
                Ok(Some(detail)) => {
                    if let Err(e) = self.handle(detail, &state) {
                        warn!(
                            "cpu {}: emulation of {:?} failed at rip {:#x}: {:?}",
                            self.cpu_id(),
                            detail,
                            state.rip,
                            e
                        );
                        self.reset_cell(true);
                    }
                }
                Ok(None) => {
                    error!(
                        "cpu {}: unhandled exit reason {:?} at rip {:#x}",
                        self.cpu_id(),
                        reason,
                        state.rip
                    );
                    self.reset_cell(true);
                }
                Err(e) => {
                    error!("cpu {}: cannot read intercept detail: {:?}", self.cpu_id(), e);
                    self.fault();
                    return Ok(Handoff::Faulted);
                }
            }
        }
    }

    /// The converse handoff: unconditionally leaves guest context,
    /// detaches the cell and returns the CPU to host context.
    pub fn deactivate(&mut self) -> AxResult<Handoff> {
        self.transition(CpuState::VmmActive, CpuState::Initialized)?;
        self.vendor_mut().deactivate();
        if let Some(cell) = self.take_cell() {
            cell.detach_cpu(self.cpu_id());
            debug!(
                "cpu {}: left guest context of cell \"{}\"",
                self.cpu_id(),
                cell.name()
            );
        }
        Ok(Handoff::Deactivated)
    }

    /// Classifies a raw exit reason, pulling the per-class detail from the
    /// vendor. `None` means the reason is unclassifiable and must fail
    /// closed.
    fn classify(&self, reason: AxExitReason) -> AxResult<Option<InterceptDetail>> {
        Ok(Some(match reason {
            AxExitReason::Io => InterceptDetail::IoAccess(self.vendor().io_intercept()?),
            AxExitReason::Mmio => InterceptDetail::MmioAccess(self.vendor().mmio_intercept()?),
            AxExitReason::MsrRead => InterceptDetail::MsrRead,
            AxExitReason::MsrWrite => InterceptDetail::MsrWrite,
            AxExitReason::Cpuid => InterceptDetail::Cpuid,
            AxExitReason::Hypercall => InterceptDetail::Hypercall,
            AxExitReason::Xsetbv => InterceptDetail::Xsetbv,
            AxExitReason::Unknown(_) => return Ok(None),
        }))
    }

    /// Routes one classified intercept to its handler.
    ///
    /// Side effects are confined to guest register state, granted guest
    /// memory, and one instruction skip on success. On failure, nothing
    /// guest-visible has been mutated.
    fn handle(&mut self, detail: InterceptDetail, state: &ExecutionState) -> AxResult {
        match detail {
            InterceptDetail::IoAccess(io) => self.handle_io(io),
            InterceptDetail::MmioAccess(mmio) => self.handle_mmio(mmio, state),
            InterceptDetail::MsrRead => self.handle_msr_read(),
            InterceptDetail::MsrWrite => self.handle_msr_write(),
            InterceptDetail::Cpuid => self.handle_cpuid(),
            InterceptDetail::Hypercall => self.handle_hypercall(state),
            InterceptDetail::Xsetbv => self.handle_xsetbv(),
        }
    }

    fn handle_io(&mut self, io: IoIntercept) -> AxResult {
        if io.rep_or_str {
            return ax_err!(Unsupported, "string/REP port I/O is not emulated");
        }
        let cell = self.cell_checked();
        if !cell.config().io_granted(io.port, io.width) {
            return ax_err!(
                PermissionDenied,
                format!("port {:#x} not granted to cell", io.port.number())
            );
        }
        if io.is_in {
            let value = self.hal().pio_read(io.port, io.width)?;
            let rax = self.vendor().gpr(regs::RAX);
            self.vendor_mut()
                .set_gpr(regs::RAX, merge_gpr(rax, value, io.width));
        } else {
            let value = self.vendor().gpr(regs::RAX) & io.width.mask();
            self.hal().pio_write(io.port, io.width, value)?;
        }
        self.vendor_mut().skip_instruction(io.inst_len);
        Ok(())
    }

    fn handle_mmio(&mut self, mmio: MmioIntercept, state: &ExecutionState) -> AxResult {
        let cell = self.cell_checked();
        let Some(region) = cell.find_region(mmio.gpa) else {
            return ax_err!(
                BadAddress,
                format!("{:?} outside all regions of cell", mmio.gpa)
            );
        };
        let direction = if mmio.is_write {
            MemFlags::WRITE
        } else {
            MemFlags::READ
        };
        if !region.flags.contains(direction) {
            return ax_err!(PermissionDenied, "MMIO access direction not permitted");
        }

        // Decode the faulting instruction; its bytes must be pulled
        // through guest translation freshly, which may be in a state a
        // regular read would reject.
        let pg = GuestPagingStructures::current(&self.vendor().paging_registers())?;
        let pc = GuestVirtAddr::from(state.rip as usize);
        let bytes = inst::inst_bytes(&pg, pc, MAX_INST_LEN, self.hal())?;
        let decoded = inst::decode_mmio(bytes.as_slice())?;
        if decoded.is_write != mmio.is_write {
            return ax_err!(InvalidData, "decoded direction contradicts intercept");
        }

        if mmio.is_write {
            let value = match decoded.operand {
                MmioOperand::Register(reg) => self.vendor().gpr(reg) & decoded.width.mask(),
                MmioOperand::Immediate(value) => value,
            };
            self.hal().mmio_write(mmio.gpa, decoded.width, value)?;
        } else {
            let MmioOperand::Register(reg) = decoded.operand else {
                return ax_err!(InvalidData, "MMIO read into an immediate");
            };
            let value = self.hal().mmio_read(mmio.gpa, decoded.width)?;
            let old = self.vendor().gpr(reg);
            self.vendor_mut()
                .set_gpr(reg, merge_gpr(old, value, decoded.width));
        }
        self.vendor_mut().skip_instruction(decoded.len);
        Ok(())
    }

    fn handle_msr_read(&mut self) -> AxResult {
        let msr = self.vendor().gpr(regs::RCX) as u32;
        let value = if msr == MSR_IA32_PAT {
            self.guest_pat
        } else {
            let cell = self.cell_checked();
            if !cell.config().msr_granted(msr) {
                return ax_err!(
                    PermissionDenied,
                    format!("rdmsr {msr:#x} not granted to cell")
                );
            }
            self.hal().read_msr(msr)?
        };
        self.vendor_mut().set_gpr(regs::RAX, value & 0xffff_ffff);
        self.vendor_mut().set_gpr(regs::RDX, value >> 32);
        self.vendor_mut().skip_instruction(INST_LEN_RDMSR);
        Ok(())
    }

    fn handle_msr_write(&mut self) -> AxResult {
        let msr = self.vendor().gpr(regs::RCX) as u32;
        let value = (self.vendor().gpr(regs::RDX) << 32)
            | (self.vendor().gpr(regs::RAX) & 0xffff_ffff);
        if msr == MSR_IA32_PAT {
            self.guest_pat = value;
            self.vendor_mut().set_guest_pat(value);
        } else {
            let cell = self.cell_checked();
            if !cell.config().msr_granted(msr) {
                return ax_err!(
                    PermissionDenied,
                    format!("wrmsr {msr:#x} not granted to cell")
                );
            }
            self.hal().write_msr(msr, value)?;
        }
        self.vendor_mut().skip_instruction(INST_LEN_WRMSR);
        Ok(())
    }

    /// Synthesizes a feature-masked CPUID result. Always succeeds.
    fn handle_cpuid(&mut self) -> AxResult {
        let leaf = self.vendor().gpr(regs::RAX) as u32;
        let subleaf = self.vendor().gpr(regs::RCX) as u32;
        let [mut eax, mut ebx, mut ecx, mut edx] = self.hal().host_cpuid(leaf, subleaf);
        match leaf {
            0x1 => {
                ecx &= !CPUID1_ECX_VMX;
                ecx |= CPUID1_ECX_HYPERVISOR;
                if self.vendor().paging_registers().cr4 & CR4_OSXSAVE != 0 {
                    ecx |= CPUID1_ECX_OSXSAVE;
                } else {
                    ecx &= !CPUID1_ECX_OSXSAVE;
                }
            }
            0x8000_0001 => {
                ecx &= !CPUID_EXT1_ECX_SVM;
            }
            CPUID_HYPERVISOR_BASE => {
                eax = CPUID_HYPERVISOR_BASE;
                ebx = u32::from_le_bytes(*b"axvc");
                ecx = u32::from_le_bytes(*b"ell\0");
                edx = u32::from_le_bytes(*b"hv\0\0");
            }
            0x4000_0001..=0x4000_ffff => {
                eax = 0;
                ebx = 0;
                ecx = 0;
                edx = 0;
            }
            _ => {}
        }
        let vendor = self.vendor_mut();
        vendor.set_gpr(regs::RAX, eax as u64);
        vendor.set_gpr(regs::RBX, ebx as u64);
        vendor.set_gpr(regs::RCX, ecx as u64);
        vendor.set_gpr(regs::RDX, edx as u64);
        vendor.skip_instruction(INST_LEN_CPUID);
        Ok(())
    }

    /// Convention: call number in RAX, arguments in RDI/RSI, result in
    /// RAX; only valid from CPL 0 in long mode. A convention violation is
    /// reported to the guest in RAX rather than escalated; the guest
    /// issued a well-formed trap, it just is not allowed the action.
    fn handle_hypercall(&mut self, state: &ExecutionState) -> AxResult {
        let result = if state.cs & 3 != 0 || state.efer & EFER_LMA == 0 {
            HYPERCALL_ERROR
        } else {
            let nr = self.vendor().gpr(regs::RAX);
            let args = [self.vendor().gpr(regs::RDI), self.vendor().gpr(regs::RSI)];
            self.hal().hypercall(nr, args).unwrap_or(HYPERCALL_ERROR)
        };
        self.vendor_mut().set_gpr(regs::RAX, result);
        self.vendor_mut().skip_instruction(INST_LEN_HYPERCALL);
        Ok(())
    }

    fn handle_xsetbv(&mut self) -> AxResult {
        if self.vendor().gpr(regs::RCX) as u32 != 0 {
            return ax_err!(InvalidInput, "only XCR0 exists");
        }
        let value = (self.vendor().gpr(regs::RDX) << 32)
            | (self.vendor().gpr(regs::RAX) & 0xffff_ffff);
        if value & XCR0_X87 == 0 {
            return ax_err!(InvalidInput, "XCR0 without x87 state");
        }
        if value & XCR0_AVX != 0 && value & XCR0_SSE == 0 {
            return ax_err!(InvalidInput, "XCR0 AVX without SSE");
        }
        let xcr0_info = self.hal().host_cpuid(0xd, 0);
        let supported = ((xcr0_info[3] as u64) << 32) | xcr0_info[0] as u64;
        if value & !supported != 0 {
            return ax_err!(InvalidInput, "XCR0 requests unsupported state");
        }
        self.hal().xsetbv(0, value);
        self.vendor_mut().skip_instruction(INST_LEN_XSETBV);
        Ok(())
    }
}

/// Writes `value` of the given width into an existing register image with
/// x86 semantics: 32-bit writes zero-extend, narrower writes preserve the
/// untouched bytes.
fn merge_gpr(old: u64, value: u64, width: AccessWidth) -> u64 {
    match width {
        AccessWidth::Dword | AccessWidth::Qword => value & width.mask(),
        _ => (old & !width.mask()) | (value & width.mask()),
    }
}
