// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::fmt;

use vm_memory::GuestAddress;

/// Identifies one IOMMU translated region exposed to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestIommuId(pub u32);

impl fmt::Display for GuestIommuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "giommu{}", self.0)
    }
}

/// Access rights attached to a guest IOMMU translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IommuAccess {
    /// No access: the entry is an invalidation.
    #[default]
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IommuAccess {
    pub fn readable(self) -> bool {
        matches!(self, IommuAccess::ReadOnly | IommuAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, IommuAccess::WriteOnly | IommuAccess::ReadWrite)
    }
}

/// One translation entry published by the guest IOMMU, either a new
/// mapping or, when `perm` is [`IommuAccess::None`], an invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IommuTlbEntry {
    /// IO virtual address as seen by the device.
    pub iova: u64,
    /// Guest physical address the entry translates to.
    pub translated_addr: GuestAddress,
    /// Size of the translated range minus one.
    pub addr_mask: u64,
    pub perm: IommuAccess,
}

impl IommuTlbEntry {
    pub fn map(iova: u64, translated_addr: GuestAddress, size: u64, perm: IommuAccess) -> Self {
        IommuTlbEntry {
            iova,
            translated_addr,
            addr_mask: size.saturating_sub(1),
            perm,
        }
    }

    pub fn invalidate(iova: u64, size: u64) -> Self {
        IommuTlbEntry {
            iova,
            translated_addr: GuestAddress(0),
            addr_mask: size.saturating_sub(1),
            perm: IommuAccess::None,
        }
    }

    pub fn size(&self) -> u64 {
        self.addr_mask.saturating_add(1)
    }

    pub fn is_invalidation(&self) -> bool {
        self.perm == IommuAccess::None
    }
}
