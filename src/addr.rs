//! Address and access-size types shared across the crate.
//!
//! Guest and host address spaces are kept apart at the type level so that a
//! guest-physical address can never be handed to an interface expecting a
//! host-physical one. The definitions follow the `memory_addr` macros.

use axerrno::{ax_err, AxError, AxResult};

memory_addr::def_usize_addr! {
    /// A guest-virtual address, as used by the guest's own page tables.
    pub type GuestVirtAddr;
    /// A guest-physical address, the output of the guest's own translation
    /// and the input of the second-level translation.
    pub type GuestPhysAddr;
    /// A host-physical address.
    pub type HostPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
    HostPhysAddr = "PA:{}";
}

/// An x86 I/O port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(pub u16);

impl Port {
    /// Returns the raw port number.
    pub const fn number(self) -> u16 {
        self.0
    }
}

/// The width of a single memory, I/O, or register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// The access size in bytes.
    pub const fn size(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    /// A mask covering the low `size()` bytes of a value.
    pub const fn mask(self) -> u64 {
        match self {
            AccessWidth::Byte => 0xff,
            AccessWidth::Word => 0xffff,
            AccessWidth::Dword => 0xffff_ffff,
            AccessWidth::Qword => u64::MAX,
        }
    }

    /// Converts an access size in bytes into a width.
    pub fn from_size(size: usize) -> AxResult<Self> {
        match size {
            1 => Ok(AccessWidth::Byte),
            2 => Ok(AccessWidth::Word),
            4 => Ok(AccessWidth::Dword),
            8 => Ok(AccessWidth::Qword),
            _ => ax_err!(InvalidInput, "invalid access size"),
        }
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = AxError;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        Self::from_size(size)
    }
}
