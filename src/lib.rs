// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVCell - vendor-neutral virtual CPU and cell control for partitioning
//! hypervisors.
//!
//! This crate owns each physical CPU's virtualization lifecycle, dispatches
//! hardware-trapped guest exits to emulation handlers, and enforces that a
//! partition ("cell") can only touch the physical and I/O resources
//! explicitly granted to it. It is the trust boundary between untrusted
//! partition code and the host: every operation a cell cannot execute
//! natively passes through here, and a case this core does not understand
//! fails safe (cell reset or CPU withdrawal), never silently misbehaves.
//!
//! Vendor-specific virtualization machinery (VM entry/exit, second-level
//! translation encoding, I/O bitmaps) is delegated to an implementation of
//! the [`AxVendorVCpu`] trait, selected once at host boot; host services
//! (device emulation, the cross-core invalidation signal) sit behind
//! [`AxCellHal`].
//!
//! # Features
//!
//! - Per-CPU lifecycle state machine (Uninitialized → Initialized →
//!   VmmActive ⇄ trap loop, plus Parked and Faulted)
//! - Exhaustive, fail-closed dispatch of intercepted operations (port I/O,
//!   MMIO, MSR, CPUID, hypercall, XSETBV)
//! - Cell memory-region management with runtime hot-plug and a synchronous
//!   cross-core translation-invalidation barrier
//! - Guest page-table walking and instruction-byte access for MMIO decode

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
mod addr; // Address, port and access-width types
mod cell; // Cells, memory regions, and the region mapper
mod cpu; // Physical CPU lifecycle state machine
mod dispatch; // Exit dispatcher and intercept handlers
mod exit; // Exit reason and intercept detail types
mod hal; // Host services the core depends on
mod inst; // Instruction access service and MMIO decode
mod paging; // Guest paging walker
mod registry; // Process-wide per-CPU record registry
mod vendor; // Vendor backend trait definition

// Public API exports
pub use addr::{AccessWidth, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, Port};
pub use cell::{AxCell, CellConfig, MemFlags, MemoryRegion, MsrRange, PortRange};
pub use cpu::{AxPhysCpu, CpuState, Handoff};
pub use exit::{AxExitReason, ExecutionState, InterceptDetail, IoIntercept, MmioIntercept};
pub use hal::AxCellHal;
pub use inst::{
    decode_mmio, inst_bytes, map_inst, InstBytes, MmioInstruction, MmioOperand, MAX_INST_LEN,
};
pub use paging::{GuestPagingStructures, PagingMode, PagingRegisters};
pub use registry::{CpuRegistry, WakeReason};
pub use vendor::{regs, AxVendorVCpu};
