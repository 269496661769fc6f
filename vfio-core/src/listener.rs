// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Keeps container IOMMU tables in sync with the guest memory topology.
//!
//! Every container subscribed to an address space receives its topology
//! transactions. RAM sections are mapped at their host virtual backing,
//! guest IOMMU windows attach a notifier instead, and anything else is left
//! to the device models.
//!
//! Once a container has replayed the topology, a failed map does not unwind
//! the transaction: it is recorded as the container's sticky error and the
//! section is queued for another attempt, as chosen by [`MapRetryPolicy`].

use vm_device::{MemorySection, SectionKind, TopologyEvent, Transaction};

use crate::config::MapRetryPolicy;
use crate::container::{ContainerError, DmaMapping, VfioContainer};
use crate::giommu::GuestIommuNotifier;
use crate::host::{DmaPermissions, VfioHost};
use crate::{Result, VfioError};

fn align_up(value: u64, align: u64) -> Option<u64> {
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
}

/// Page aligned IO virtual range covered by `section`, if not empty.
fn dma_range(section: &MemorySection, pgsize: u64) -> Option<(u64, u64)> {
    let iova = align_up(section.start.0, pgsize)?;
    let end = section.end() & !(pgsize - 1);
    if end <= iova {
        return None;
    }
    Some((iova, end - iova))
}

pub(crate) struct MappingListener<'a> {
    host: &'a dyn VfioHost,
    policy: MapRetryPolicy,
}

impl<'a> MappingListener<'a> {
    pub(crate) fn new(host: &'a dyn VfioHost, policy: MapRetryPolicy) -> Self {
        MappingListener { host, policy }
    }

    /// Maps every section already present when the container subscribes.
    /// The first failure is returned and the container must be discarded.
    pub(crate) fn replay(
        &self,
        container: &mut VfioContainer,
        sections: &[MemorySection],
    ) -> Result<()> {
        for section in sections {
            self.region_add(container, section)?;
        }
        debug!(
            "{}: replayed {} sections, {} mappings",
            container.id,
            sections.len(),
            container.backend.mappings().len()
        );
        Ok(())
    }

    /// Applies `txn`, removals first, then retries what previously failed.
    pub(crate) fn commit(&self, container: &mut VfioContainer, txn: &Transaction) {
        let mut retry = std::mem::take(&mut container.pending);

        for event in txn.ordered() {
            match event {
                TopologyEvent::Remove(section) => {
                    if retry.contains(section) {
                        retry.retain(|s| s != section);
                        debug!(
                            "{}: dropping pending map of [0x{:x}, 0x{:x})",
                            container.id,
                            section.start.0,
                            section.end()
                        );
                        continue;
                    }
                    self.region_del(container, section);
                }
                TopologyEvent::Add(section) => {
                    if let Err(e) = self.region_add(container, section) {
                        self.defer(container, section, e);
                    }
                }
            }
        }

        for section in retry {
            let due = match self.policy {
                MapRetryPolicy::AnyEvent => true,
                MapRetryPolicy::TouchingRange => txn
                    .events()
                    .iter()
                    .any(|e| e.section().overlaps(section.start.0, section.size)),
            };
            if !due {
                container.pending.push(section);
                continue;
            }
            debug!(
                "{}: retrying map of [0x{:x}, 0x{:x})",
                container.id,
                section.start.0,
                section.end()
            );
            if let Err(e) = self.region_add(container, &section) {
                self.defer(container, &section, e);
            }
        }

        if container.pending.is_empty() {
            if let Some(error) = container.backend.clear_error() {
                info!(
                    "{}: DMA mappings recovered after failure at 0x{:x}",
                    container.id, error.iova
                );
            }
        }
    }

    fn defer(&self, container: &mut VfioContainer, section: &MemorySection, e: VfioError) {
        warn!(
            "{}: failed to map [0x{:x}, 0x{:x}), will retry: {}",
            container.id,
            section.start.0,
            section.end(),
            e
        );
        container.backend.record_error(ContainerError {
            iova: section.start.0,
            size: section.size,
            errno: e.errno(),
        });
        container.pending.push(*section);
    }

    pub(crate) fn region_add(
        &self,
        container: &mut VfioContainer,
        section: &MemorySection,
    ) -> Result<()> {
        match section.kind {
            SectionKind::Mmio => Ok(()),
            SectionKind::Iommu(iommu) => {
                let notifier = GuestIommuNotifier::new(iommu, section);
                if !container.giommus.contains(&notifier) {
                    debug!("{}: attaching {}", container.id, notifier);
                    container.giommus.push(notifier);
                }
                Ok(())
            }
            SectionKind::Ram => {
                let Some(host_addr) = section.host_addr else {
                    return Ok(());
                };
                let Some((iova, size)) = dma_range(section, container.backend.pgsize()) else {
                    debug!(
                        "{}: skipping empty range at 0x{:x}",
                        container.id, section.start.0
                    );
                    return Ok(());
                };

                let mut perm = DmaPermissions::READ;
                if !section.readonly {
                    perm |= DmaPermissions::WRITE;
                }
                container.dma_map(
                    self.host,
                    DmaMapping {
                        iova,
                        size,
                        vaddr: host_addr + (iova - section.start.0),
                        perm,
                    },
                )
            }
        }
    }

    /// Tears down what `section` mapped. A section still waiting for a
    /// retry never got a translation, so nothing is unmapped for it.
    pub(crate) fn region_del(&self, container: &mut VfioContainer, section: &MemorySection) {
        if container.pending.contains(section) {
            container.pending.retain(|s| s != section);
            return;
        }

        let range = match section.kind {
            SectionKind::Mmio => return,
            SectionKind::Iommu(iommu) => {
                let notifier = GuestIommuNotifier::new(iommu, section);
                if let Some(pos) = container.giommus.iter().position(|n| *n == notifier) {
                    debug!("{}: detaching {}", container.id, notifier);
                    container.giommus.remove(pos);
                }
                // Whatever the guest IOMMU left mapped in the window goes too.
                (section.size != 0).then_some((section.start.0, section.size))
            }
            SectionKind::Ram => {
                if section.host_addr.is_none() {
                    return;
                }
                dma_range(section, container.backend.pgsize())
            }
        };

        let Some((iova, size)) = range else {
            return;
        };
        if let Err(e) = container.dma_unmap(self.host, iova, size) {
            if container.backend.error().is_some() {
                debug!(
                    "{}: ignoring unmap failure at 0x{:x}, already in error: {}",
                    container.id, iova, e
                );
            } else {
                error!(
                    "{}: failed to unmap 0x{:x} bytes at 0x{:x}: {}",
                    container.id, size, iova, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vm_device::{AddressSpaceId, GuestIommuId};
    use vm_memory::GuestAddress;

    use super::*;
    use crate::container::{ContainerId, IommuBackend, Type1Backend};
    use crate::host::IommuType;
    use crate::test_util::{HostCall, MockHost};

    const HVA: u64 = 0x7f00_0000_0000;

    fn container(host: &MockHost, pgsize: u64) -> VfioContainer {
        let handle = host.open_container().unwrap();
        VfioContainer::new(
            ContainerId(0),
            AddressSpaceId(0),
            handle,
            IommuBackend::Type1(Type1Backend::new(IommuType::Type1v2, pgsize)),
        )
    }

    fn ram(start: u64, size: u64) -> MemorySection {
        MemorySection::ram(GuestAddress(start), size, HVA + start)
    }

    #[test]
    fn test_dma_range_alignment() {
        assert_eq!(dma_range(&ram(0x1000, 0x1000), 0x1000), Some((0x1000, 0x1000)));
        assert_eq!(dma_range(&ram(0x1800, 0x2000), 0x1000), Some((0x2000, 0x1000)));
        assert_eq!(dma_range(&ram(0x1800, 0x1000), 0x1000), None);
        assert_eq!(dma_range(&ram(0x1800, 0x1000), 0x800), Some((0x1800, 0x1000)));
        assert_eq!(
            dma_range(&MemorySection::ram(GuestAddress(u64::MAX - 0x10), 0x10, 0), 0x1000),
            None
        );
    }

    #[test]
    fn test_replay_maps_ram_only() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        listener
            .replay(
                &mut c,
                &[
                    ram(0, 0x10_0000),
                    MemorySection::mmio(GuestAddress(0x10_0000), 0x1000),
                    MemorySection::iommu(GuestAddress(0x8000_0000), 0x1000_0000, GuestIommuId(0)),
                    ram(0x20_0000, 0x1000).into_readonly(),
                ],
            )
            .unwrap();

        assert_eq!(c.giommus.len(), 1);
        let mappings = c.backend.mappings();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].vaddr, HVA);
        assert_eq!(mappings[1].perm, DmaPermissions::READ);
    }

    #[test]
    fn test_replay_failure_is_returned() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        host.fail_dma_map(0x2000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        assert!(listener.replay(&mut c, &[ram(0x2000, 0x1000)]).is_err());
        assert!(c.pending.is_empty());
        assert!(c.backend.error().is_none());
    }

    #[test]
    fn test_failure_is_sticky_until_retried() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        listener.replay(&mut c, &[]).unwrap();

        host.fail_dma_map(0x4000);
        listener.commit(&mut c, &Transaction::new().add(ram(0x4000, 0x1000)));
        let error = c.backend.error().unwrap();
        assert_eq!(error.iova, 0x4000);
        assert_eq!(error.errno, Some(libc::EFAULT));
        assert_eq!(c.pending, vec![ram(0x4000, 0x1000)]);

        // Still failing: stays pending and in error.
        listener.commit(&mut c, &Transaction::new().add(ram(0x10_0000, 0x1000)));
        assert_eq!(c.pending.len(), 1);
        assert!(c.backend.error().is_some());

        // An unrelated event is enough to retry.
        host.clear_dma_map_failures();
        listener.commit(&mut c, &Transaction::new().add(ram(0x20_0000, 0x1000)));
        assert!(c.pending.is_empty());
        assert_eq!(c.backend.error(), None);
        assert_eq!(host.mappings(c.handle).len(), 3);
    }

    #[test]
    fn test_touching_range_policy() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::TouchingRange);
        listener.replay(&mut c, &[]).unwrap();

        host.fail_dma_map(0x4000);
        listener.commit(&mut c, &Transaction::new().add(ram(0x4000, 0x2000)));
        host.clear_dma_map_failures();

        listener.commit(&mut c, &Transaction::new().add(ram(0x10_0000, 0x1000)));
        assert_eq!(c.pending.len(), 1);
        assert!(c.backend.error().is_some());

        // Any event overlapping the failed range triggers the retry, even
        // one that maps nothing itself.
        listener.commit(
            &mut c,
            &Transaction::new().add(MemorySection::mmio(GuestAddress(0x5000), 0x100)),
        );
        assert!(c.pending.is_empty());
        assert_eq!(c.backend.error(), None);
        assert!(host.mappings(c.handle).contains(&(0x4000, 0x2000)));
    }

    #[test]
    fn test_removing_pending_section_drops_retry() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        listener.replay(&mut c, &[]).unwrap();

        host.fail_dma_map(0x4000);
        listener.commit(&mut c, &Transaction::new().add(ram(0x4000, 0x1000)));
        listener.commit(&mut c, &Transaction::new().remove(ram(0x4000, 0x1000)));
        assert!(c.pending.is_empty());
        assert_eq!(c.backend.error(), None);
        assert!(!host
            .calls()
            .iter()
            .any(|call| matches!(call, HostCall::DmaUnmap { .. })));
    }

    #[test]
    fn test_removing_pending_section_keeps_overlapping_mapping() {
        let host = MockHost::new();
        let mut c = container(&host, 0x800);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        listener.replay(&mut c, &[]).unwrap();

        let live = ram(0x1000, 0x1000);
        let rejected = ram(0x1800, 0x1000);
        listener.commit(&mut c, &Transaction::new().add(live));
        listener.commit(&mut c, &Transaction::new().add(rejected));
        assert_eq!(c.backend.error().unwrap().errno, Some(libc::EEXIST));
        assert_eq!(c.pending, vec![rejected]);

        listener.commit(&mut c, &Transaction::new().remove(rejected));
        assert!(c.pending.is_empty());
        assert_eq!(c.backend.error(), None);
        assert_eq!(host.mappings(c.handle), vec![(0x1000, 0x1000)]);
        assert_eq!(c.backend.mappings().len(), 1);

        // Same when the removal happens outside a commit.
        listener.commit(&mut c, &Transaction::new().add(rejected));
        listener.region_del(&mut c, &rejected);
        assert!(c.pending.is_empty());
        assert_eq!(host.mappings(c.handle), vec![(0x1000, 0x1000)]);
    }

    #[test]
    fn test_unmap_failure_in_error_is_ignored() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        listener.replay(&mut c, &[ram(0, 0x1000)]).unwrap();

        host.fail_dma_map(0x8000);
        host.fail_dma_unmap(true);
        listener.commit(
            &mut c,
            &Transaction::new()
                .add(ram(0x8000, 0x1000))
                .remove(ram(0, 0x1000)),
        );
        // The unmap ran first, while the container was still healthy.
        assert!(c.backend.error().is_some());
        assert_eq!(c.backend.mappings().len(), 1);

        listener.commit(&mut c, &Transaction::new().remove(ram(0, 0x1000)));
        assert_eq!(c.backend.mappings().len(), 1);
    }

    #[test]
    fn test_iommu_window_lifecycle() {
        let host = MockHost::new();
        let mut c = container(&host, 0x1000);
        let listener = MappingListener::new(&host, MapRetryPolicy::AnyEvent);
        let window = MemorySection::iommu(GuestAddress(0x1_0000_0000), 0x10_0000, GuestIommuId(3));
        listener.replay(&mut c, &[window]).unwrap();
        listener.commit(&mut c, &Transaction::new().add(window));
        assert_eq!(c.giommus.len(), 1);

        c.dma_map(
            &host,
            DmaMapping {
                iova: 0x1_0000_0000,
                size: 0x1000,
                vaddr: HVA,
                perm: DmaPermissions::READ,
            },
        )
        .unwrap();

        listener.commit(&mut c, &Transaction::new().remove(window));
        assert!(c.giommus.is_empty());
        assert!(c.backend.mappings().is_empty());
    }
}
