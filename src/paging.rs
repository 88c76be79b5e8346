//! Guest paging walker.
//!
//! Resolves guest-virtual addresses through the guest's own page tables,
//! as currently configured by the guest. A [`GuestPagingStructures`]
//! snapshot is recomputed from the control registers on every use and
//! never cached across an exit boundary: the guest is free to reprogram
//! its translation whenever it is not trapped into this core.

use axerrno::{ax_err, AxResult};
use memory_addr::PAGE_SIZE_4K;

use crate::addr::{GuestPhysAddr, GuestVirtAddr};
use crate::hal::AxCellHal;

const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const PTE_P: u64 = 1 << 0;
const PTE_PS: u64 = 1 << 7;

/// Physical-address bits of a 64-bit (long/PAE) table entry.
const PHYS_MASK_64: u64 = 0x000f_ffff_ffff_f000;
/// Physical-address bits of a 32-bit (legacy) table entry.
const PHYS_MASK_32: u64 = 0xffff_f000;

/// Guest control-register state the walker classifies, supplied by the
/// vendor backend per use.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagingRegisters {
    /// Guest CR0.
    pub cr0: u64,
    /// Guest CR3.
    pub cr3: u64,
    /// Guest CR4.
    pub cr4: u64,
    /// Guest IA32_EFER.
    pub efer: u64,
}

/// The guest's addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Paging disabled; guest-virtual equals guest-physical.
    Disabled,
    /// 32-bit two-level paging, 4-byte entries.
    Legacy,
    /// PAE three-level paging.
    Pae,
    /// Long-mode four-level paging.
    Long,
}

/// A snapshot of the guest's currently active translation configuration.
#[derive(Debug, Clone, Copy)]
pub struct GuestPagingStructures {
    /// The addressing mode in effect.
    pub mode: PagingMode,
    /// Guest-physical address of the root table (meaningless when paging
    /// is disabled).
    pub root: GuestPhysAddr,
}

/// One level of a table walk: index position/width within the virtual
/// address, and whether a PS entry ends the walk early at this level.
struct Level {
    shift: u32,
    bits: u32,
    large: bool,
}

impl GuestPagingStructures {
    /// Classifies the guest's current translation configuration.
    ///
    /// Fails with `BadState` if the guest is in a transitional or
    /// unsupported configuration (long mode partially enabled), so callers
    /// can fail the current trap safely instead of walking an inconsistent
    /// table.
    pub fn current(regs: &PagingRegisters) -> AxResult<Self> {
        if regs.cr0 & CR0_PG == 0 {
            return Ok(Self {
                mode: PagingMode::Disabled,
                root: GuestPhysAddr::from(0),
            });
        }
        if (regs.efer & EFER_LME != 0) != (regs.efer & EFER_LMA != 0) {
            return ax_err!(BadState, "guest paging in transitional long-mode state");
        }
        if regs.efer & EFER_LMA != 0 {
            if regs.cr4 & CR4_PAE == 0 {
                return ax_err!(BadState, "long mode active without PAE");
            }
            Ok(Self {
                mode: PagingMode::Long,
                root: GuestPhysAddr::from((regs.cr3 & PHYS_MASK_64) as usize),
            })
        } else if regs.cr4 & CR4_PAE != 0 {
            Ok(Self {
                mode: PagingMode::Pae,
                root: GuestPhysAddr::from((regs.cr3 & 0xffff_ffe0) as usize),
            })
        } else {
            Ok(Self {
                mode: PagingMode::Legacy,
                root: GuestPhysAddr::from((regs.cr3 & PHYS_MASK_32) as usize),
            })
        }
    }

    /// Resolves `gva` to its guest-physical address.
    ///
    /// On success, also returns the number of bytes from `gva` to the end
    /// of the containing mapping, which bounds how far a caller may read
    /// contiguously. Fails with `BadAddress` on a non-present entry.
    pub fn walk<H: AxCellHal>(
        &self,
        gva: GuestVirtAddr,
        hal: &H,
    ) -> AxResult<(GuestPhysAddr, usize)> {
        match self.mode {
            PagingMode::Disabled => {
                let offset = gva.as_usize() & (PAGE_SIZE_4K - 1);
                Ok((
                    GuestPhysAddr::from(gva.as_usize()),
                    PAGE_SIZE_4K - offset,
                ))
            }
            PagingMode::Long => self.walk_levels(
                gva,
                hal,
                &[
                    Level { shift: 39, bits: 9, large: false },
                    Level { shift: 30, bits: 9, large: true },
                    Level { shift: 21, bits: 9, large: true },
                    Level { shift: 12, bits: 9, large: false },
                ],
                8,
                PHYS_MASK_64,
            ),
            PagingMode::Pae => self.walk_levels(
                gva,
                hal,
                &[
                    Level { shift: 30, bits: 2, large: false },
                    Level { shift: 21, bits: 9, large: true },
                    Level { shift: 12, bits: 9, large: false },
                ],
                8,
                PHYS_MASK_64,
            ),
            PagingMode::Legacy => self.walk_levels(
                gva,
                hal,
                &[
                    Level { shift: 22, bits: 10, large: true },
                    Level { shift: 12, bits: 10, large: false },
                ],
                4,
                PHYS_MASK_32,
            ),
        }
    }

    fn walk_levels<H: AxCellHal>(
        &self,
        gva: GuestVirtAddr,
        hal: &H,
        levels: &[Level],
        entry_size: usize,
        phys_mask: u64,
    ) -> AxResult<(GuestPhysAddr, usize)> {
        let va = gva.as_usize() as u64;
        let mut table = self.root;
        for (depth, level) in levels.iter().enumerate() {
            let index = ((va >> level.shift) as usize) & ((1 << level.bits) - 1);
            let entry = read_entry(hal, table, index, entry_size)?;
            if entry & PTE_P == 0 {
                return ax_err!(BadAddress, "guest mapping not present");
            }
            let terminal = depth == levels.len() - 1;
            if terminal || (level.large && entry & PTE_PS != 0) {
                let page_size = 1usize << level.shift;
                let base = entry & phys_mask & !(page_size as u64 - 1);
                let offset = gva.as_usize() & (page_size - 1);
                return Ok((GuestPhysAddr::from(base as usize + offset), page_size - offset));
            }
            table = GuestPhysAddr::from((entry & phys_mask) as usize);
        }
        unreachable!("terminal level always returns");
    }
}

fn read_entry<H: AxCellHal>(
    hal: &H,
    table: GuestPhysAddr,
    index: usize,
    entry_size: usize,
) -> AxResult<u64> {
    let mut buf = [0u8; 8];
    hal.read_guest_phys(table + index * entry_size, &mut buf[..entry_size])?;
    Ok(u64::from_le_bytes(buf))
}
