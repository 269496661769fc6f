// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Guest memory topology as seen by listeners.
//!
//! A topology source describes the guest physical layout of one address
//! space as a set of [`MemorySection`]s. Every change is published as a
//! [`Transaction`], the difference between the previous layout and the new
//! one.

use std::fmt;

use vm_memory::{GuestAddress, GuestUsize};

use crate::iommu::GuestIommuId;

/// Identity of one address space (guest memory, or any other DMA visible
/// space).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u32);

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// What backs a section of the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    /// Resident memory with a host virtual backing.
    Ram,
    /// A window translated by a guest visible IOMMU.
    Iommu(GuestIommuId),
    /// Emulated registers, never DMA mapped.
    Mmio,
}

/// Guest physical range and what backs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySection {
    pub start: GuestAddress,
    pub size: GuestUsize,
    /// Host virtual address backing `start`, for RAM sections.
    pub host_addr: Option<u64>,
    pub readonly: bool,
    pub kind: SectionKind,
}

impl MemorySection {
    pub fn ram(start: GuestAddress, size: GuestUsize, host_addr: u64) -> Self {
        MemorySection {
            start,
            size,
            host_addr: Some(host_addr),
            readonly: false,
            kind: SectionKind::Ram,
        }
    }

    pub fn iommu(start: GuestAddress, size: GuestUsize, id: GuestIommuId) -> Self {
        MemorySection {
            start,
            size,
            host_addr: None,
            readonly: false,
            kind: SectionKind::Iommu(id),
        }
    }

    pub fn mmio(start: GuestAddress, size: GuestUsize) -> Self {
        MemorySection {
            start,
            size,
            host_addr: None,
            readonly: false,
            kind: SectionKind::Mmio,
        }
    }

    /// Marks the section as read-only from the device point of view.
    pub fn into_readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// First address past the section, saturating at the top of the space.
    pub fn end(&self) -> u64 {
        self.start.0.saturating_add(self.size)
    }

    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr.0 >= self.start.0 && addr.0 < self.end()
    }

    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        size != 0 && self.size != 0 && start < self.end() && self.start.0 < start.saturating_add(size)
    }

    /// Host virtual address of `addr`, if the section is host backed and
    /// contains it.
    pub fn host_address(&self, addr: GuestAddress) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }
        self.host_addr.map(|base| base + (addr.0 - self.start.0))
    }
}

/// A single topology change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    Add(MemorySection),
    Remove(MemorySection),
}

impl TopologyEvent {
    pub fn section(&self) -> &MemorySection {
        match self {
            TopologyEvent::Add(s) | TopologyEvent::Remove(s) => s,
        }
    }
}

/// An ordered batch of topology changes applied atomically by listeners.
///
/// Listeners observe every removal before any addition, so a range that is
/// removed and re-added with a different backing never has both the stale
/// and the fresh translation installed at the same time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    events: Vec<TopologyEvent>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, section: MemorySection) -> Self {
        self.events.push(TopologyEvent::Add(section));
        self
    }

    /// Records the removal of `section`. An addition of the very same
    /// section earlier in this transaction cancels out instead.
    pub fn remove(mut self, section: MemorySection) -> Self {
        if let Some(pos) = self
            .events
            .iter()
            .rposition(|e| *e == TopologyEvent::Add(section))
        {
            self.events.remove(pos);
        } else {
            self.events.push(TopologyEvent::Remove(section));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Events in generation order.
    pub fn events(&self) -> &[TopologyEvent] {
        &self.events
    }

    /// Events in the order listeners must apply them: all removals, then
    /// all additions, each group keeping its generation order.
    pub fn ordered(&self) -> impl Iterator<Item = &TopologyEvent> {
        let removals = self
            .events
            .iter()
            .filter(|e| matches!(e, TopologyEvent::Remove(_)));
        let additions = self
            .events
            .iter()
            .filter(|e| matches!(e, TopologyEvent::Add(_)));
        removals.chain(additions)
    }
}

/// Source of the current layout of one address space. Listeners query it
/// when they register so that ranges already present get replayed.
pub trait MemoryTopology: Send + Sync {
    fn id(&self) -> AddressSpaceId;

    fn sections(&self) -> Vec<MemorySection>;
}
