// Copyright © 2019 Intel Corporation
// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use bitflags::bitflags;
use vmm_sys_util::eventfd::EventFd;

use crate::host::{DeviceFlags, HostHandle, IrqInfo, IrqSet, VfioHost};
use crate::region::VfioRegion;
use crate::reset::ResetDomain;
use crate::{Result, VfioError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Pci,
    Platform,
    Other,
}

impl From<DeviceFlags> for DeviceType {
    fn from(flags: DeviceFlags) -> Self {
        if flags.contains(DeviceFlags::PCI) {
            DeviceType::Pci
        } else if flags.contains(DeviceFlags::PLATFORM) {
            DeviceType::Platform
        } else {
            DeviceType::Other
        }
    }
}

bitflags! {
    /// Hooks a device model actually implements.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceCapabilities: u32 {
        const COMPUTE_NEEDS_RESET = 1 << 0;
        const HOT_RESET_MULTI = 1 << 1;
        const EOI = 1 << 2;
    }
}

/// Optional hooks the guest visible device model attaches to a device.
///
/// Every hook defaults to "not supported". The registry only invokes a hook
/// when [`VfioDeviceOps::capabilities`] advertises it, and always with its
/// lock held, so hooks must not call back into the registry.
pub trait VfioDeviceOps: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::empty()
    }

    /// Whether the device needs a reset, based on what the host or the
    /// guest left it in.
    fn compute_needs_reset(&self, _device: &VfioDevice) -> bool {
        false
    }

    /// Resets every device of `domain` at once.
    fn hot_reset_multi(&self, _domain: &ResetDomain) -> Result<()> {
        Ok(())
    }

    /// Acknowledges the completion of a level triggered interrupt.
    fn eoi(&self, _device: &VfioDevice) {}
}

/// A passthrough device opened by name within a group.
pub struct VfioDevice {
    id: DeviceId,
    name: String,
    group_id: u32,
    handle: HostHandle,
    flags: DeviceFlags,
    num_regions: u32,
    num_irqs: u32,
    regions: Vec<VfioRegion>,
    irqs: HashMap<u32, IrqInfo>,
    reset_works: bool,
    needs_reset: bool,
    ops: Option<Arc<dyn VfioDeviceOps>>,
}

impl VfioDevice {
    /// Opens `name` within the group behind `group` and populates its
    /// regions and interrupt table from what the host reports.
    ///
    /// With `map_windows` set, a direct-map window is installed over every
    /// mappable region. A failed window leaves that region trap-only and
    /// does not fail the open.
    pub(crate) fn open(
        host: &dyn VfioHost,
        id: DeviceId,
        name: &str,
        group_id: u32,
        group: HostHandle,
        map_windows: bool,
        ops: Option<Arc<dyn VfioDeviceOps>>,
    ) -> Result<Self> {
        let handle = host.open_device(group, name)?;
        let info = match host.device_info(handle) {
            Ok(info) => info,
            Err(e) => {
                if let Err(e) = host.close_device(handle) {
                    warn!("Failed to close device {}: {}", name, e);
                }
                return Err(e);
            }
        };

        let mut device = VfioDevice {
            id,
            name: name.to_owned(),
            group_id,
            handle,
            flags: info.flags,
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
            regions: Vec::new(),
            irqs: HashMap::new(),
            reset_works: info.flags.contains(DeviceFlags::RESET),
            needs_reset: false,
            ops,
        };

        for index in 0..info.num_regions {
            let region_info = match host.region_info(handle, index) {
                Ok(region_info) => region_info,
                Err(e) => {
                    warn!("Could not get region #{} info for {}: {}", index, name, e);
                    continue;
                }
            };

            debug!("Region #{}", index);
            debug!("\tflag 0x{:x}", region_info.flags.bits());
            debug!("\tsize 0x{:x}", region_info.size);
            debug!("\toffset 0x{:x}", region_info.offset);

            let mut region = VfioRegion::new(&region_info);
            if map_windows && region.is_mappable() && region.size() > 0 {
                if let Err(e) = region.map(host, handle, None) {
                    warn!(
                        "Region #{} of {} stays trap-only, direct mapping failed: {}",
                        index, name, e
                    );
                }
            }
            device.regions.push(region);
        }

        for index in 0..info.num_irqs {
            match host.irq_info(handle, index) {
                Ok(irq) => {
                    debug!("IRQ #{}", index);
                    debug!("\tflag 0x{:x}", irq.flags.bits());
                    debug!("\tcount {}", irq.count);
                    device.irqs.insert(index, irq);
                }
                Err(e) => warn!("Could not get IRQ #{} info for {}: {}", index, name, e),
            }
        }

        info!(
            "Opened device {} in group {}: {} regions, {} irqs, reset {}",
            name,
            group_id,
            info.num_regions,
            info.num_irqs,
            if device.reset_works { "supported" } else { "unsupported" }
        );

        Ok(device)
    }

    /// Releases every direct-map window, then the host handle. When the
    /// host refuses to close the device it stays open in trap-only mode.
    pub(crate) fn close(&mut self, host: &dyn VfioHost) -> Result<()> {
        for region in self.regions.iter_mut() {
            region.unmap();
        }
        host.close_device(self.handle)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn handle(&self) -> HostHandle {
        self.handle
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from(self.flags)
    }

    pub fn num_regions(&self) -> u32 {
        self.num_regions
    }

    pub fn num_irqs(&self) -> u32 {
        self.num_irqs
    }

    pub fn reset_works(&self) -> bool {
        self.reset_works
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub(crate) fn set_needs_reset(&mut self, needs_reset: bool) {
        self.needs_reset = needs_reset;
    }

    pub fn regions(&self) -> &[VfioRegion] {
        &self.regions
    }

    pub fn region(&self, index: u32) -> Result<&VfioRegion> {
        self.regions
            .iter()
            .find(|r| r.index() == index)
            .ok_or(VfioError::InvalidRegion(index))
    }

    pub(crate) fn region_mut(&mut self, index: u32) -> Result<&mut VfioRegion> {
        self.regions
            .iter_mut()
            .find(|r| r.index() == index)
            .ok_or(VfioError::InvalidRegion(index))
    }

    pub fn irq(&self, index: u32) -> Option<&IrqInfo> {
        self.irqs.get(&index)
    }

    /// Largest vector count across the interrupt indexes.
    pub fn max_interrupts(&self) -> u32 {
        self.irqs.values().map(|irq| irq.count).max().unwrap_or(0)
    }

    pub(crate) fn ops(&self) -> Option<&Arc<dyn VfioDeviceOps>> {
        self.ops.as_ref()
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.ops
            .as_ref()
            .map_or(DeviceCapabilities::empty(), |ops| ops.capabilities())
    }

    pub fn supports(&self, capability: DeviceCapabilities) -> bool {
        self.capabilities().contains(capability)
    }

    fn usable_irq(&self, index: u32) -> Result<&IrqInfo> {
        match self.irqs.get(&index) {
            Some(irq) if irq.count > 0 => Ok(irq),
            _ => Err(VfioError::InvalidIrqIndex(index)),
        }
    }

    pub(crate) fn mask_irq(&self, host: &dyn VfioHost, index: u32) -> Result<()> {
        self.usable_irq(index)?;
        host.set_irqs(self.handle, &IrqSet::mask(index))
    }

    pub(crate) fn unmask_irq(&self, host: &dyn VfioHost, index: u32) -> Result<()> {
        self.usable_irq(index)?;
        host.set_irqs(self.handle, &IrqSet::unmask(index))
    }

    pub(crate) fn disable_irq(&self, host: &dyn VfioHost, index: u32) -> Result<()> {
        self.usable_irq(index)?;
        host.set_irqs(self.handle, &IrqSet::disable(index))
    }

    /// Tells the host which eventfd to signal for each vector of `index`.
    pub(crate) fn enable_irq(
        &self,
        host: &dyn VfioHost,
        index: u32,
        event_fds: &[&EventFd],
    ) -> Result<()> {
        let irq = self.usable_irq(index)?;
        if event_fds.is_empty() || event_fds.len() > irq.count as usize {
            return Err(VfioError::InvalidIrqIndex(index));
        }
        let fds = event_fds.iter().map(|e| e.as_raw_fd()).collect();
        host.set_irqs(self.handle, &IrqSet::trigger(index, fds))
    }

    /// Runs the end-of-interrupt hook. Returns false when the device model
    /// has none.
    pub(crate) fn eoi(&self) -> bool {
        match self.ops.as_ref() {
            Some(ops) if ops.capabilities().contains(DeviceCapabilities::EOI) => {
                ops.eoi(self);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for VfioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfioDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("regions", &self.regions)
            .field("reset_works", &self.reset_works)
            .field("needs_reset", &self.needs_reset)
            .finish()
    }
}
