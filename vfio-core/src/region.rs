// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use byteorder::{ByteOrder, LittleEndian};

use crate::host::{HostHandle, RegionFlags, RegionInfo, VfioHost};
use crate::mmap::MmapRegion;
use crate::{Result, VfioError};

/// How a region access is carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessPath {
    /// Load or store against the direct-map window.
    Direct,
    /// Synchronous call into the host.
    Trap,
}

/// Direct-map state of a region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapState {
    /// No window: the region is not mappable or was never mapped.
    Unmapped,
    /// The window covers the whole region.
    Mapped,
    /// Only the first `len` bytes are mapped, the rest is trapped.
    Partial { len: u64 },
    /// The last mapping attempt failed and every access is trapped.
    Failed { errno: Option<i32> },
}

/// One mappable range of a device.
pub struct VfioRegion {
    index: u32,
    flags: RegionFlags,
    size: u64,
    fd_offset: u64,
    mmap: Option<MmapRegion>,
    state: MapState,
}

impl VfioRegion {
    pub(crate) fn new(info: &RegionInfo) -> Self {
        VfioRegion {
            index: info.index,
            flags: info.flags,
            size: info.size,
            fd_offset: info.offset,
            mmap: None,
            state: MapState::Unmapped,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the region within the device handle.
    pub fn fd_offset(&self) -> u64 {
        self.fd_offset
    }

    pub fn map_state(&self) -> &MapState {
        &self.state
    }

    /// Bytes covered by the direct-map window.
    pub fn mapped_len(&self) -> u64 {
        self.mmap.as_ref().map_or(0, |m| m.len() as u64)
    }

    /// True when the region is mappable but some of it is trapped because
    /// a mapping attempt failed or only partially succeeded.
    pub fn is_degraded(&self) -> bool {
        matches!(self.state, MapState::Failed { .. } | MapState::Partial { .. })
    }

    pub fn is_mappable(&self) -> bool {
        self.flags.contains(RegionFlags::MMAP)
    }

    /// Installs a direct-map window over the first `window` bytes of the
    /// region, the whole region when `None`.
    ///
    /// Mapping again with the window already in place is a no-op. When the
    /// mapping fails the region stays usable through the trap path and the
    /// failure is both returned and kept in [`MapState::Failed`].
    ///
    /// # Panics
    ///
    /// If `window` is larger than the region.
    pub(crate) fn map(
        &mut self,
        host: &dyn VfioHost,
        device: HostHandle,
        window: Option<u64>,
    ) -> Result<()> {
        if !self.is_mappable() {
            return Err(VfioError::AccessDenied(self.index));
        }

        let window = window.unwrap_or(self.size);
        assert!(
            window <= self.size,
            "window 0x{:x} exceeds region {} size 0x{:x}",
            window,
            self.index,
            self.size
        );
        if window == 0 {
            self.unmap();
            return Ok(());
        }

        match self.state {
            MapState::Mapped | MapState::Partial { .. } if self.mapped_len() == window => {
                return Ok(());
            }
            _ => {}
        }

        // Drop any previous window before installing the new one.
        self.mmap = None;

        match host.mmap_region(device, self.fd_offset, window, self.flags) {
            Ok(mmap) => {
                assert_eq!(
                    mmap.len() as u64,
                    window,
                    "host returned a window of the wrong size for region {}",
                    self.index
                );
                self.mmap = Some(mmap);
                self.state = if window == self.size {
                    MapState::Mapped
                } else {
                    MapState::Partial { len: window }
                };
                debug!(
                    "Region {} mapped 0x{:x}/0x{:x} bytes",
                    self.index, window, self.size
                );
                Ok(())
            }
            Err(e) => {
                self.state = MapState::Failed {
                    errno: e.raw_os_error(),
                };
                Err(VfioError::MappingFailed {
                    iova: self.fd_offset,
                    size: window,
                    source: e,
                })
            }
        }
    }

    /// Removes the direct-map window, if any.
    pub(crate) fn unmap(&mut self) {
        if self.mmap.take().is_some() {
            debug!("Region {} unmapped", self.index);
        }
        self.state = MapState::Unmapped;
    }

    pub(crate) fn access_path(&self, offset: u64, width: usize, allow_mmap: bool) -> AccessPath {
        let Some(mmap) = self.mmap.as_ref() else {
            return AccessPath::Trap;
        };
        let in_window = offset
            .checked_add(width as u64)
            .is_some_and(|end| end <= mmap.len() as u64);

        if allow_mmap && self.is_mappable() && in_window && offset % width as u64 == 0 {
            AccessPath::Direct
        } else {
            AccessPath::Trap
        }
    }

    fn check_access(&self, offset: u64, width: usize, needed: RegionFlags) -> Result<()> {
        let in_bounds = offset
            .checked_add(width as u64)
            .is_some_and(|end| end <= self.size);
        if !matches!(width, 1 | 2 | 4 | 8) || !in_bounds {
            return Err(VfioError::InvalidAccess { offset, width });
        }
        if !self.flags.contains(needed) {
            return Err(VfioError::AccessDenied(self.index));
        }
        Ok(())
    }

    pub(crate) fn read(
        &self,
        host: &dyn VfioHost,
        device: HostHandle,
        offset: u64,
        width: usize,
        allow_mmap: bool,
    ) -> Result<u64> {
        self.check_access(offset, width, RegionFlags::READ)?;

        if self.access_path(offset, width, allow_mmap) == AccessPath::Direct {
            if let Some(value) = self
                .mmap
                .as_ref()
                .and_then(|m| m.read_volatile(offset as usize, width))
            {
                return Ok(value);
            }
        }

        let mut buf = [0u8; 8];
        host.region_read(device, self.fd_offset + offset, &mut buf[..width])?;
        Ok(LittleEndian::read_uint(&buf[..width], width))
    }

    pub(crate) fn write(
        &self,
        host: &dyn VfioHost,
        device: HostHandle,
        offset: u64,
        width: usize,
        value: u64,
        allow_mmap: bool,
    ) -> Result<()> {
        self.check_access(offset, width, RegionFlags::WRITE)?;

        if self.access_path(offset, width, allow_mmap) == AccessPath::Direct
            && self
                .mmap
                .as_ref()
                .is_some_and(|m| m.write_volatile(offset as usize, width, value))
        {
            return Ok(());
        }

        let value = if width == 8 {
            value
        } else {
            value & ((1u64 << (width * 8)) - 1)
        };
        let mut buf = [0u8; 8];
        LittleEndian::write_uint(&mut buf[..width], value, width);
        host.region_write(device, self.fd_offset + offset, &buf[..width])
    }
}

impl std::fmt::Debug for VfioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioRegion")
            .field("index", &self.index)
            .field("flags", &self.flags)
            .field("size", &self.size)
            .field("fd_offset", &self.fd_offset)
            .field("state", &self.state)
            .finish()
    }
}
