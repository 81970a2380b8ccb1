//! Boot Probe - GRUB4DOS Drive Mappings
//!
//! GRUB4DOS leaves sector-mapped drives behind in low memory when it hands
//! off to the OS. The probe follows the INT 13h "safe hook" chain from the
//! real-mode interrupt vector table, finds the GRUB4DOS hook, and reads its
//! drive map. Every live mapping becomes one child disk on the bus.
//!
//! The image handed to `scan` is a copy of physical memory starting at 0.

use std::sync::Arc;

use log::{debug, info};

use crate::bus::{Bus, BusNode};
use crate::device::DeviceHandle;
use crate::disk::{Geometry, Media, RamDisk};
use crate::error::BusResult;

// ============================================================================
// Layout Constants
// ============================================================================

/// Bytes of low memory worth scanning
pub const LOW_MEMORY_SIZE: usize = 0x10_0000;

/// INT 13h vector in the real-mode IVT
const INT13_VECTOR: usize = 0x13 * 4;

/// Safe hook signature, after the 3-byte jump
pub const SAFE_HOOK_SIGNATURE: &[u8; 8] = b"$INT13SF";

/// Vendor ID GRUB4DOS puts in its safe hook
pub const GRUB4DOS_VENDOR: &[u8; 8] = b"GRUB4DOS";

/// Drive map offset within the hook's segment
const DRIVE_MAP_OFFSET: usize = 0x20;

/// Number of drive map slots
pub const DRIVE_MAP_SLOTS: usize = 8;

/// Packed size of one drive map slot
pub const DRIVE_MAP_SLOT_SIZE: usize = 24;

/// Hooks followed before giving up on a chain
const MAX_HOOKS: usize = 32;

/// 'G4DX'; the low byte is replaced by the source drive
const G4D_HASH: u32 = 0x4734_4458;

fn le_u16(image: &[u8], at: usize) -> Option<u16> {
    let bytes = image.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn le_u64(image: &[u8], at: usize) -> Option<u64> {
    let bytes = image.get(at..at.checked_add(8)?)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

// ============================================================================
// Interrupt Vectors and Safe Hooks
// ============================================================================

/// A real-mode far pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntVector {
    pub offset: u16,
    pub segment: u16,
}

impl IntVector {
    pub fn read(image: &[u8], at: usize) -> Option<Self> {
        Some(Self {
            offset: le_u16(image, at)?,
            segment: le_u16(image, at + 2)?,
        })
    }

    /// Linear address of the segment base
    pub const fn segment_base(self) -> usize {
        (self.segment as usize) << 4
    }

    /// Linear address the vector points at
    pub const fn linear(self) -> usize {
        self.segment_base() + self.offset as usize
    }
}

/// An INT 13h hook that follows the safe hook convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeHook {
    pub vendor: [u8; 8],
    pub prev: IntVector,
}

impl SafeHook {
    /// Decode the hook `vector` points at, if it carries the signature
    pub fn at(image: &[u8], vector: IntVector) -> Option<Self> {
        let base = vector.linear();
        let signature = image.get(base + 3..base + 11)?;
        if signature != SAFE_HOOK_SIGNATURE {
            return None;
        }
        let mut vendor = [0u8; 8];
        vendor.copy_from_slice(image.get(base + 11..base + 19)?);
        Some(Self {
            vendor,
            prev: IntVector::read(image, base + 19)?,
        })
    }

    pub fn is_grub4dos(&self) -> bool {
        &self.vendor == GRUB4DOS_VENDOR
    }
}

// ============================================================================
// Drive Map
// ============================================================================

/// One raw GRUB4DOS drive map slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveMapSlot {
    pub source_drive: u8,
    pub dest_drive: u8,
    pub max_head: u8,
    pub max_sector: u8,
    pub dest_max_cylinder: u16,
    pub source_odd: bool,
    pub dest_odd: bool,
    pub dest_lba: bool,
    pub dest_max_head: u8,
    pub dest_max_sector: u8,
    pub sector_start: u64,
    pub sector_count: u64,
}

impl DriveMapSlot {
    /// Decode a packed 24-byte slot
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DRIVE_MAP_SLOT_SIZE {
            return None;
        }
        let cyl = le_u16(raw, 4)?;
        Some(Self {
            source_drive: raw[0],
            dest_drive: raw[1],
            max_head: raw[2],
            max_sector: raw[3] & 0x3f,
            dest_max_cylinder: cyl & 0x1fff,
            source_odd: cyl & (1 << 13) != 0,
            dest_odd: cyl & (1 << 14) != 0,
            dest_lba: cyl & (1 << 15) != 0,
            dest_max_head: raw[6],
            dest_max_sector: raw[7] & 0x3f,
            sector_start: le_u64(raw, 8)?,
            sector_count: le_u64(raw, 16)?,
        })
    }

    /// Is this slot a live sector mapping?
    pub fn is_sector_mapped(&self) -> bool {
        self.sector_count != 0 && self.dest_drive != 0xff
    }
}

/// A sector-mapped drive found in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveMapping {
    pub source_drive: u8,
    pub media: Media,
    pub sector_size: u32,
    /// Byte offset of the image on the backing disk
    pub offset: u64,
    pub sectors: u64,
    pub geometry: Geometry,
    pub hash: u32,
    pub boot_drive: bool,
}

impl DriveMapping {
    pub fn from_slot(slot: &DriveMapSlot) -> Self {
        let media = if slot.source_odd {
            Media::Optical
        } else if slot.source_drive & 0x80 != 0 {
            Media::Hard
        } else {
            Media::Floppy
        };
        let dest_sector_size: u64 = if slot.dest_odd { 2048 } else { 512 };

        Self {
            source_drive: slot.source_drive,
            media,
            sector_size: media.default_sector_size(),
            offset: slot.sector_start.saturating_mul(dest_sector_size),
            sectors: slot.sector_count,
            geometry: Geometry::from_size(
                slot.sector_count,
                u32::from(slot.max_head) + 1,
                u32::from(slot.dest_max_sector),
            ),
            hash: (G4D_HASH & !0xff) | u32::from(slot.source_drive),
            boot_drive: true,
        }
    }

    /// Build a memory-backed disk shaped like this mapping
    pub fn to_disk(&self, name: &str) -> RamDisk {
        RamDisk::new(name, self.media, self.sectors)
            .with_sector_size(self.sector_size)
            .with_geometry(self.geometry)
            .with_boot_drive(self.boot_drive)
            .with_hash(self.hash)
    }
}

// ============================================================================
// Scan and Attach
// ============================================================================

/// Find every GRUB4DOS sector mapping reachable from the INT 13h vector
pub fn scan(image: &[u8]) -> Vec<DriveMapping> {
    let mut mappings = Vec::new();
    let Some(mut vector) = IntVector::read(image, INT13_VECTOR) else {
        debug!("probe: image too small for the IVT");
        return mappings;
    };

    for _ in 0..MAX_HOOKS {
        let Some(hook) = SafeHook::at(image, vector) else {
            break;
        };
        if !hook.is_grub4dos() {
            debug!("probe: non-GRUB4DOS INT 13h safe hook at {:#x}", vector.linear());
            vector = hook.prev;
            continue;
        }

        let map = vector.segment_base() + DRIVE_MAP_OFFSET;
        for i in (0..DRIVE_MAP_SLOTS).rev() {
            let at = map + i * DRIVE_MAP_SLOT_SIZE;
            let Some(slot) = image.get(at..).and_then(DriveMapSlot::parse) else {
                continue;
            };
            if !slot.is_sector_mapped() {
                debug!("probe: skipping non-sector-mapped slot {}", i);
                continue;
            }
            debug!("probe: slot {}: {:x?}", i, slot);
            mappings.push(DriveMapping::from_slot(&slot));
        }
        vector = hook.prev;
    }

    if mappings.is_empty() {
        debug!("probe: no GRUB4DOS sector-mapped disks found");
    }
    mappings
}

/// Add one child to `bus` per mapping
///
/// Stops at the first child the bus refuses; children already added stay.
pub fn attach<F>(bus: &Arc<Bus>, mappings: &[DriveMapping], mut make_disk: F) -> BusResult<Vec<Arc<BusNode>>>
where
    F: FnMut(&DriveMapping) -> DeviceHandle,
{
    let mut nodes = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let node = BusNode::new(make_disk(mapping));
        let num = bus.add_node(&node)?;
        info!(
            "probe: drive {:#04x} ({:?}, {} sectors) attached as unit {}",
            mapping.source_drive, mapping.media, mapping.sectors, num
        );
        nodes.push(node);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusState;
    use crate::error::BusError;

    const HOOK_SEG: u16 = 0x9000;

    fn put_hook(image: &mut [u8], at: IntVector, vendor: &[u8; 8], prev: IntVector) {
        let base = at.linear();
        image[base..base + 3].copy_from_slice(&[0xEB, 0x1C, 0x90]);
        image[base + 3..base + 11].copy_from_slice(SAFE_HOOK_SIGNATURE);
        image[base + 11..base + 19].copy_from_slice(vendor);
        image[base + 19..base + 21].copy_from_slice(&prev.offset.to_le_bytes());
        image[base + 21..base + 23].copy_from_slice(&prev.segment.to_le_bytes());
    }

    fn put_vector(image: &mut [u8], at: usize, v: IntVector) {
        image[at..at + 2].copy_from_slice(&v.offset.to_le_bytes());
        image[at + 2..at + 4].copy_from_slice(&v.segment.to_le_bytes());
    }

    fn put_slot(image: &mut [u8], seg: u16, i: usize, slot: &DriveMapSlot) {
        let at = ((seg as usize) << 4) + DRIVE_MAP_OFFSET + i * DRIVE_MAP_SLOT_SIZE;
        let mut cyl = slot.dest_max_cylinder & 0x1fff;
        cyl |= u16::from(slot.source_odd) << 13;
        cyl |= u16::from(slot.dest_odd) << 14;
        cyl |= u16::from(slot.dest_lba) << 15;
        image[at] = slot.source_drive;
        image[at + 1] = slot.dest_drive;
        image[at + 2] = slot.max_head;
        image[at + 3] = slot.max_sector;
        image[at + 4..at + 6].copy_from_slice(&cyl.to_le_bytes());
        image[at + 6] = slot.dest_max_head;
        image[at + 7] = slot.dest_max_sector;
        image[at + 8..at + 16].copy_from_slice(&slot.sector_start.to_le_bytes());
        image[at + 16..at + 24].copy_from_slice(&slot.sector_count.to_le_bytes());
    }

    fn hard_slot() -> DriveMapSlot {
        DriveMapSlot {
            source_drive: 0x80,
            dest_drive: 0x81,
            max_head: 15,
            max_sector: 63,
            dest_max_sector: 63,
            sector_start: 2048,
            sector_count: 100_800,
            ..DriveMapSlot::default()
        }
    }

    fn floppy_slot() -> DriveMapSlot {
        DriveMapSlot {
            source_drive: 0x00,
            dest_drive: 0xE0,
            max_head: 1,
            max_sector: 18,
            dest_odd: true,
            dest_max_sector: 18,
            sector_start: 100,
            sector_count: 2880,
            ..DriveMapSlot::default()
        }
    }

    fn grub_image() -> Vec<u8> {
        let mut image = vec![0u8; LOW_MEMORY_SIZE];
        let hook = IntVector { offset: 0, segment: HOOK_SEG };
        put_vector(&mut image, INT13_VECTOR, hook);
        put_hook(&mut image, hook, GRUB4DOS_VENDOR, IntVector::default());
        image
    }

    #[test]
    fn test_slot_parse() {
        let mut image = grub_image();
        let slot = DriveMapSlot {
            source_odd: true,
            dest_lba: true,
            dest_max_cylinder: 0x1234,
            ..hard_slot()
        };
        put_slot(&mut image, HOOK_SEG, 0, &slot);
        let at = ((HOOK_SEG as usize) << 4) + DRIVE_MAP_OFFSET;
        assert_eq!(DriveMapSlot::parse(&image[at..]), Some(slot));
        assert_eq!(DriveMapSlot::parse(&image[at..at + 23]), None);
    }

    #[test]
    fn test_mapping_from_slot() {
        let hard = DriveMapping::from_slot(&hard_slot());
        assert_eq!(hard.media, Media::Hard);
        assert_eq!(hard.sector_size, 512);
        assert_eq!(hard.offset, 2048 * 512);
        assert_eq!(hard.geometry.heads, 16);
        assert_eq!(hard.geometry.sectors_per_track, 63);
        assert_eq!(hard.geometry.cylinders, 100);
        assert_eq!(hard.hash, 0x4734_4480);
        assert!(hard.boot_drive);

        let floppy = DriveMapping::from_slot(&floppy_slot());
        assert_eq!(floppy.media, Media::Floppy);
        assert_eq!(floppy.offset, 100 * 2048);
        assert_eq!(floppy.geometry.cylinders, 80);
        assert_eq!(floppy.hash, 0x4734_4400);

        let cd = DriveMapping::from_slot(&DriveMapSlot {
            source_drive: 0x9f,
            source_odd: true,
            ..hard_slot()
        });
        assert_eq!(cd.media, Media::Optical);
        assert_eq!(cd.sector_size, 2048);
    }

    #[test]
    fn test_zero_sectors_per_track() {
        let mapping = DriveMapping::from_slot(&DriveMapSlot {
            dest_max_sector: 0,
            ..hard_slot()
        });
        assert_eq!(mapping.geometry.cylinders, 0);
    }

    #[test]
    fn test_scan_walks_slots_backwards() {
        let mut image = grub_image();
        put_slot(&mut image, HOOK_SEG, 0, &hard_slot());
        put_slot(&mut image, HOOK_SEG, 3, &floppy_slot());
        put_slot(
            &mut image,
            HOOK_SEG,
            5,
            &DriveMapSlot {
                dest_drive: 0xff,
                ..hard_slot()
            },
        );
        put_slot(
            &mut image,
            HOOK_SEG,
            7,
            &DriveMapSlot {
                sector_count: 0,
                ..hard_slot()
            },
        );

        let found = scan(&image);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].media, Media::Floppy);
        assert_eq!(found[1].media, Media::Hard);
    }

    #[test]
    fn test_scan_follows_chain() {
        let mut image = grub_image();
        put_slot(&mut image, HOOK_SEG, 1, &hard_slot());

        // Another vendor's hook installed after GRUB4DOS
        let other = IntVector { offset: 0x10, segment: 0x8000 };
        put_hook(&mut image, other, b"MEMDISK ", IntVector { offset: 0, segment: HOOK_SEG });
        put_vector(&mut image, INT13_VECTOR, other);

        let found = scan(&image);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_drive, 0x80);
    }

    #[test]
    fn test_scan_without_hook() {
        assert!(scan(&vec![0u8; LOW_MEMORY_SIZE]).is_empty());
        assert!(scan(&[0u8; 16]).is_empty());
    }

    #[test]
    fn test_scan_cycle_terminates() {
        let mut image = vec![0u8; LOW_MEMORY_SIZE];
        let hook = IntVector { offset: 0x40, segment: 0x7000 };
        put_vector(&mut image, INT13_VECTOR, hook);
        put_hook(&mut image, hook, b"LOOPING!", hook);
        assert!(scan(&image).is_empty());
    }

    #[test]
    fn test_attach_adds_each_mapping_once() {
        let mut image = grub_image();
        put_slot(&mut image, HOOK_SEG, 0, &hard_slot());
        put_slot(&mut image, HOOK_SEG, 1, &floppy_slot());
        let found = scan(&image);

        let bus = Bus::create();
        let mut made = 0;
        let nodes = attach(&bus, &found, |m| {
            made += 1;
            Arc::new(m.to_disk(&format!("g4d{:02x}", m.source_drive)))
        })
        .unwrap();

        assert_eq!(made, 2);
        assert_eq!(bus.node_count(), 2);
        assert_eq!(nodes[0].num(), 0);
        assert_eq!(nodes[0].pdo().name(), "g4d00");
        assert_eq!(nodes[1].pdo().name(), "g4d80");
    }

    #[test]
    fn test_attach_refused_while_removing() {
        let bus = Bus::create();
        bus.state_machine().apply(crate::bus::PnpEvent::SurpriseRemoval).unwrap();
        let mapping = DriveMapping::from_slot(&hard_slot());
        let err = attach(&bus, &[mapping], |m| Arc::new(m.to_disk("g4d"))).unwrap_err();
        assert!(matches!(
            err,
            BusError::NotAcceptingChildren(BusState::SurpriseRemovePending)
        ));
    }
}
