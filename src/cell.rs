//! Cells and their memory-region sets.
//!
//! A cell is an isolated partition: a named set of memory regions, the
//! vendor-owned second-level translation and I/O bitmap state built from
//! them, and the set of physical CPUs currently hosting it. The region set
//! may be mutated at runtime (hot-plug) under a single-mutator discipline:
//! one `spin::Mutex` guards both the region list and the vendor state, and
//! every structural change completes a cross-core translation-invalidation
//! broadcast before it returns, so no hosting CPU can keep using a stale
//! mapping after the mutator returns.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};
use log::{debug, warn};
use memory_addr::is_aligned_4k;
use spin::Mutex;

use crate::addr::{AccessWidth, GuestPhysAddr, HostPhysAddr, Port};
use crate::hal::AxCellHal;
use crate::vendor::AxVendorVCpu;

bitflags! {
    /// Access rights of a [`MemoryRegion`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Readable by the cell.
        const READ = 1 << 0;
        /// Writable by the cell.
        const WRITE = 1 << 1;
        /// Executable by the cell.
        const EXECUTE = 1 << 2;
        /// Directly assigned device memory (I/O passthrough).
        const IO = 1 << 3;
    }
}

/// One physical memory region granted to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Host-physical base.
    pub phys_start: HostPhysAddr,
    /// Guest-visible base.
    pub virt_start: GuestPhysAddr,
    /// Length in bytes.
    pub size: usize,
    /// Access rights.
    pub flags: MemFlags,
}

impl MemoryRegion {
    /// Whether `gpa` lies inside this region.
    pub fn contains(&self, gpa: GuestPhysAddr) -> bool {
        gpa >= self.virt_start && gpa.as_usize() - self.virt_start.as_usize() < self.size
    }

    /// Whether the guest-visible ranges of two regions intersect.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.virt_start.as_usize() < other.virt_start.as_usize() + other.size
            && other.virt_start.as_usize() < self.virt_start.as_usize() + self.size
    }

    /// Checks alignment and bounds against the second-level translation
    /// granularity.
    pub fn validate(&self) -> AxResult {
        if self.size == 0
            || !is_aligned_4k(self.size)
            || !is_aligned_4k(self.virt_start.as_usize())
            || !is_aligned_4k(self.phys_start.as_usize())
        {
            return ax_err!(InvalidInput, "memory region not page-granular");
        }
        if self.virt_start.as_usize().checked_add(self.size).is_none() {
            return ax_err!(InvalidInput, "memory region wraps the address space");
        }
        Ok(())
    }
}

/// An inclusive-start, exclusive-end range of I/O ports granted to a cell.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    /// First granted port.
    pub start: u16,
    /// Number of granted ports.
    pub count: u16,
}

impl PortRange {
    fn covers(&self, port: u16, bytes: usize) -> bool {
        let start = self.start as usize;
        let end = start + self.count as usize;
        let first = port as usize;
        first >= start && first + bytes <= end
    }
}

/// A range of MSR indices granted to a cell for passthrough access.
#[derive(Debug, Clone, Copy)]
pub struct MsrRange {
    /// First granted MSR index.
    pub start: u32,
    /// Number of granted indices.
    pub count: u32,
}

impl MsrRange {
    fn covers(&self, msr: u32) -> bool {
        msr >= self.start && msr - self.start < self.count
    }
}

/// Externally-loaded cell configuration: the initial region set and the
/// I/O and MSR permission grants. Read-only from this core's perspective;
/// runtime region changes go through the explicit map/unmap calls.
#[derive(Debug, Clone, Default)]
pub struct CellConfig {
    /// Cell name, for the logs.
    pub name: String,
    /// Initial memory regions, mapped at cell creation.
    pub regions: Vec<MemoryRegion>,
    /// I/O port grants, the source data for the vendor I/O bitmap.
    pub io_grants: Vec<PortRange>,
    /// MSR passthrough grants.
    pub msr_grants: Vec<MsrRange>,
}

impl CellConfig {
    /// Whether every port touched by an access of `width` at `port` is
    /// granted.
    pub fn io_granted(&self, port: Port, width: AccessWidth) -> bool {
        self.io_grants
            .iter()
            .any(|range| range.covers(port.number(), width.size()))
    }

    /// Whether `msr` is granted for passthrough access.
    pub fn msr_granted(&self, msr: u32) -> bool {
        self.msr_grants.iter().any(|range| range.covers(msr))
    }
}

struct CellInner<V: AxVendorVCpu> {
    regions: Vec<MemoryRegion>,
    vendor: V::CellState,
}

/// A partition and its granted resources.
pub struct AxCell<V: AxVendorVCpu> {
    config: CellConfig,
    inner: Mutex<CellInner<V>>,
    /// Bitmask of physical CPUs currently hosting this cell.
    cpus: AtomicUsize,
}

impl<V: AxVendorVCpu> AxCell<V> {
    /// Creates a cell from its configuration: validates the initial region
    /// set, builds the vendor state, and installs every initial region.
    ///
    /// No invalidation broadcast is needed here; no CPU hosts the cell
    /// yet.
    pub fn new(config: CellConfig) -> AxResult<Self> {
        for (i, region) in config.regions.iter().enumerate() {
            region.validate()?;
            if config.regions[..i].iter().any(|r| r.overlaps(region)) {
                return ax_err!(AlreadyExists, "overlapping regions in cell config");
            }
        }
        let mut vendor = V::cell_init(&config)?;
        for region in &config.regions {
            if let Err(e) = V::map_region(&mut vendor, region) {
                V::cell_exit(&mut vendor);
                return Err(e);
            }
        }
        debug!(
            "cell \"{}\": created with {} regions",
            config.name,
            config.regions.len()
        );
        Ok(Self {
            inner: Mutex::new(CellInner {
                regions: config.regions.clone(),
                vendor,
            }),
            config,
            cpus: AtomicUsize::new(0),
        })
    }

    /// The cell's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The cell's permission grants.
    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    /// Bitmask of physical CPUs currently hosting this cell.
    pub fn cpu_mask(&self) -> usize {
        self.cpus.load(Ordering::Acquire)
    }

    /// Installs one region into the cell's second-level translation
    /// (runtime memory hot-plug).
    ///
    /// Serialized against concurrent mutation by the cell lock. The change
    /// is durable only once every hosting CPU has acknowledged the
    /// invalidation broadcast, which happens before this call returns.
    pub fn map_region<H: AxCellHal>(&self, region: MemoryRegion, hal: &H) -> AxResult {
        region.validate()?;
        let mut inner = self.inner.lock();
        if inner.regions.iter().any(|r| r.overlaps(&region)) {
            return ax_err!(AlreadyExists, "region overlaps a mapped region");
        }
        V::map_region(&mut inner.vendor, &region)?;
        inner.regions.push(region);
        debug!(
            "cell \"{}\": mapped {:#x?} + {:#x}",
            self.name(),
            region.virt_start,
            region.size
        );
        hal.broadcast_tlb_flush(self.cpu_mask());
        Ok(())
    }

    /// Removes exactly one previously-mapped region.
    ///
    /// The region is matched by guest-visible base and size; `NotFound` if
    /// no such region is mapped. Same durability barrier as
    /// [`AxCell::map_region`].
    pub fn unmap_region<H: AxCellHal>(&self, region: &MemoryRegion, hal: &H) -> AxResult {
        let mut inner = self.inner.lock();
        let index = inner
            .regions
            .iter()
            .position(|r| r.virt_start == region.virt_start && r.size == region.size);
        let Some(index) = index else {
            return ax_err!(NotFound, "region is not mapped");
        };
        let removed = inner.regions[index];
        V::unmap_region(&mut inner.vendor, &removed)?;
        inner.regions.swap_remove(index);
        debug!(
            "cell \"{}\": unmapped {:#x?} + {:#x}",
            self.name(),
            removed.virt_start,
            removed.size
        );
        hal.broadcast_tlb_flush(self.cpu_mask());
        Ok(())
    }

    /// Finds the region containing `gpa`, if any.
    pub fn find_region(&self, gpa: GuestPhysAddr) -> Option<MemoryRegion> {
        self.inner
            .lock()
            .regions
            .iter()
            .find(|r| r.contains(gpa))
            .copied()
    }

    /// A snapshot of the currently mapped regions.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.inner.lock().regions.clone()
    }

    /// Runs `f` against the vendor cell state while holding the cell lock.
    /// Used by a CPU binding itself to this cell.
    pub(crate) fn with_vendor_state<R>(&self, f: impl FnOnce(&V::CellState) -> R) -> R {
        f(&self.inner.lock().vendor)
    }

    pub(crate) fn attach_cpu(&self, cpu_id: usize) {
        self.cpus.fetch_or(1 << cpu_id, Ordering::AcqRel);
    }

    pub(crate) fn detach_cpu(&self, cpu_id: usize) {
        self.cpus.fetch_and(!(1 << cpu_id), Ordering::AcqRel);
    }
}

impl<V: AxVendorVCpu> Drop for AxCell<V> {
    fn drop(&mut self) {
        if self.cpu_mask() != 0 {
            warn!(
                "cell \"{}\": destroyed while CPUs {:#x} still attached",
                self.name(),
                self.cpu_mask()
            );
        }
        V::cell_exit(&mut self.inner.get_mut().vendor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(virt: usize, size: usize) -> MemoryRegion {
        MemoryRegion {
            phys_start: HostPhysAddr::from(virt),
            virt_start: GuestPhysAddr::from(virt),
            size,
            flags: MemFlags::READ | MemFlags::WRITE,
        }
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = region(0x1000, 0x2000);
        let b = region(0x2000, 0x1000);
        let c = region(0x3000, 0x1000);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn contains_is_half_open() {
        let r = region(0x1000, 0x1000);
        assert!(r.contains(GuestPhysAddr::from(0x1000)));
        assert!(r.contains(GuestPhysAddr::from(0x1fff)));
        assert!(!r.contains(GuestPhysAddr::from(0x2000)));
        assert!(!r.contains(GuestPhysAddr::from(0xfff)));
    }

    #[test]
    fn validate_rejects_misalignment() {
        assert!(region(0x1000, 0x800).validate().is_err());
        assert!(region(0x1234, 0x1000).validate().is_err());
        assert!(region(0x1000, 0).validate().is_err());
        assert!(region(0x1000, 0x1000).validate().is_ok());
    }

    #[test]
    fn port_grant_covers_full_access() {
        let grant = PortRange { start: 0x3f8, count: 8 };
        assert!(grant.covers(0x3f8, 1));
        assert!(grant.covers(0x3fc, 4));
        assert!(!grant.covers(0x3fd, 4));
        assert!(!grant.covers(0x3f7, 1));
    }
}
