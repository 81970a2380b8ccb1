//! Memory-Backed Disk - A Child Device for the Bus
//!
//! Sectors live in a sparse map and read back as zeros until written.
//! Requests must be sector aligned. Once the bus tells the disk to remove
//! itself its contents are released and every later request fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde::Deserialize;
use spin::Mutex;

use crate::bus::PnpMinor;
use crate::device::{DeviceObject, IoStatus, Irp, MajorFunction, Reply};

// ============================================================================
// Media and Geometry
// ============================================================================

/// Kind of media a disk presents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Media {
    Floppy,
    Hard,
    Optical,
}

impl Media {
    /// Sector size used when none is configured
    pub const fn default_sector_size(self) -> u32 {
        match self {
            Media::Floppy | Media::Hard => 512,
            Media::Optical => 2048,
        }
    }
}

/// CHS geometry reported for the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors_per_track: u32,
}

impl Geometry {
    /// Derive cylinders from a total size; zero if the divisor is zero
    pub fn from_size(sectors: u64, heads: u32, sectors_per_track: u32) -> Self {
        let per_cylinder = u64::from(heads) * u64::from(sectors_per_track);
        Self {
            cylinders: sectors.checked_div(per_cylinder).unwrap_or(0),
            heads,
            sectors_per_track,
        }
    }
}

// ============================================================================
// RAM Disk
// ============================================================================

/// A sparse in-memory disk
pub struct RamDisk {
    name: String,
    media: Media,
    sector_size: u32,
    sectors: u64,
    geometry: Geometry,
    boot_drive: bool,
    hash: u32,
    data: Mutex<BTreeMap<u64, Box<[u8]>>>,
    removed: AtomicBool,
}

impl RamDisk {
    pub fn new(name: &str, media: Media, sectors: u64) -> Self {
        Self {
            name: String::from(name),
            media,
            sector_size: media.default_sector_size(),
            sectors,
            geometry: Geometry::default(),
            boot_drive: false,
            hash: 0,
            data: Mutex::new(BTreeMap::new()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Mark as the drive the machine booted from
    pub fn with_boot_drive(mut self, boot_drive: bool) -> Self {
        self.boot_drive = boot_drive;
        self
    }

    /// Identity used to match the disk against its backing store
    pub fn with_hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    pub fn media(&self) -> Media {
        self.media
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_boot_drive(&self) -> bool {
        self.boot_drive
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Size in bytes
    pub fn capacity(&self) -> u64 {
        self.sectors.saturating_mul(u64::from(self.sector_size))
    }

    /// First sector and sector count of an aligned byte range
    fn sector_range(&self, offset: u64, length: u64) -> Option<(u64, u64)> {
        let size = u64::from(self.sector_size);
        if size == 0 || offset % size != 0 || length % size != 0 {
            return None;
        }
        let end = offset.checked_add(length)?;
        if end > self.capacity() {
            return None;
        }
        Some((offset / size, length / size))
    }

    /// Read whole sectors at `offset` into `buf`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoStatus {
        if self.is_removed() {
            return IoStatus::NoSuchDevice;
        }
        let Some((first, _)) = self.sector_range(offset, buf.len() as u64) else {
            return IoStatus::Unsuccessful;
        };

        let data = self.data.lock();
        for (lba, chunk) in (first..).zip(buf.chunks_mut(self.sector_size as usize)) {
            match data.get(&lba) {
                Some(sector) => chunk.copy_from_slice(sector),
                None => chunk.fill(0),
            }
        }
        IoStatus::Success
    }

    /// Write whole sectors from `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> IoStatus {
        if self.is_removed() {
            return IoStatus::NoSuchDevice;
        }
        let Some((first, _)) = self.sector_range(offset, buf.len() as u64) else {
            return IoStatus::Unsuccessful;
        };

        let mut data = self.data.lock();
        for (lba, chunk) in (first..).zip(buf.chunks(self.sector_size as usize)) {
            if chunk.iter().all(|&b| b == 0) {
                data.remove(&lba);
            } else {
                data.insert(lba, chunk.into());
            }
        }
        IoStatus::Success
    }

    fn remove(&self) {
        if !self.removed.swap(true, Ordering::AcqRel) {
            self.data.lock().clear();
            debug!("{}: removed", self.name);
        }
    }
}

impl DeviceObject for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, irp: &mut Irp) -> IoStatus {
        match irp.major() {
            MajorFunction::Read { offset, length } => {
                let mut buf = vec![0u8; length as usize];
                let status = self.read_at(offset, &mut buf);
                if status == IoStatus::Success {
                    *irp.buffer_mut() = buf;
                    irp.set_reply(Reply::Bytes(length as usize));
                }
                status
            }
            MajorFunction::Write { offset } => {
                let status = self.write_at(offset, irp.buffer());
                if status == IoStatus::Success {
                    let written = irp.buffer().len();
                    irp.set_reply(Reply::Bytes(written));
                }
                status
            }
            MajorFunction::Pnp(minor) if minor == PnpMinor::RemoveDevice.code() => {
                self.remove();
                IoStatus::Success
            }
            _ if self.is_removed() => IoStatus::NoSuchDevice,
            _ => IoStatus::NotSupported,
        }
    }
}

impl core::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamDisk")
            .field("name", &self.name)
            .field("media", &self.media)
            .field("sector_size", &self.sector_size)
            .field("sectors", &self.sectors)
            .field("boot_drive", &self.boot_drive)
            .field("removed", &self.is_removed())
            .finish()
    }
}
