//! Out-of-mount recovery / repair tool (spec §4.6 "Recovery / fsck", §6
//! exit codes).
//!
//! Unlike the rest of the engine, this module never assumes a mounted
//! `Engine`: it is meant to run against a device nothing currently has
//! open, so it talks to a [`BlockDevice`] directly.

use log::{info, warn};

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::record::{self, HEADER_SIZE};
use crate::ring::RingMap;
use crate::superblock::{
    CheckFlags, DEVICE_BLOCK_SIZE, FIXABLE, FLAG_DIRTY, FLAG_UPDATE, FLAG_VALID, KNOWN_FLAGS,
    SUPERBLOCK_SIZE, SuperBlock, check_sb,
};

pub const EXIT_OK: u32 = 0;
pub const EXIT_CORRECTED: u32 = 1;
pub const EXIT_REBOOT_NEEDED: u32 = 2;
pub const EXIT_UNCORRECTED: u32 = 4;
pub const EXIT_OPERATIONAL_ERROR: u32 = 8;
pub const EXIT_USAGE: u32 = 16;
pub const EXIT_CANCELLED: u32 = 32;

/// Knobs for the optional second, record-streaming pass.
#[derive(Debug, Clone, Copy)]
pub struct FsckOptions {
    /// Stream the ring and repair CRC-broken records, rather than
    /// stopping once the superblocks are consistent.
    pub repair_records: bool,
    /// Spec §4.6: "policy-driven; default is to ask". A non-interactive
    /// caller (e.g. a scripted `shallfsck -y`) sets this to skip the
    /// prompt and always repair.
    pub assume_yes: bool,
}

impl Default for FsckOptions {
    fn default() -> Self {
        Self { repair_records: false, assume_yes: false }
    }
}

fn read_sb_raw(device: &dyn BlockDevice, n: u32) -> Option<SuperBlock> {
    let mut buf = [0u8; SUPERBLOCK_SIZE];
    device.read_at(SuperBlock::byte_offset(n), &mut buf).ok()?;
    SuperBlock::decode(&buf).map(|(sb, _)| sb)
}

/// Finds a usable starting superblock the way mount does (spec §4.1), but
/// tolerates — rather than refuses on — a `DIRTY` flag, since fsck's job
/// is precisely to clean that up.
fn find_starting_superblock(device: &dyn BlockDevice) -> Result<(SuperBlock, u32)> {
    let device_size = device.size();

    if let Some(sb) = read_sb_raw(device, 0) {
        if sb.flags & FLAG_UPDATE != 0 {
            return Err(Error::NotMounted("superblock has an interrupted update pending"));
        }
        return Ok((sb, 0));
    }

    let mut n = 1u32;
    loop {
        if SuperBlock::location(n) * DEVICE_BLOCK_SIZE >= device_size {
            return Err(Error::Invalid);
        }
        if let Some(sb) = read_sb_raw(device, n) {
            if sb.flags & FLAG_UPDATE != 0 {
                return Err(Error::NotMounted("superblock has an interrupted update pending"));
            }
            return Ok((sb, n));
        }
        n += 1;
    }
}

/// Runs the repair pass against `device`, returning the spec §6 exit-code
/// bitmask.
pub fn fsck(device: &mut dyn BlockDevice, options: &FsckOptions) -> u32 {
    let (sb, _index) = match find_starting_superblock(device) {
        Ok(v) => v,
        Err(Error::NotMounted(msg)) => {
            warn!("fsck: {msg}; operator must complete the resize before running repair");
            return EXIT_UNCORRECTED;
        }
        Err(_) => return EXIT_UNCORRECTED | EXIT_OPERATIONAL_ERROR,
    };

    let defects = check_sb(&sb, Some(device.size()));
    let mut repaired = sb.clone();
    let mut exit_code = EXIT_OK;

    if !defects.is_empty() {
        let unfixable = CheckFlags(defects.0 & !FIXABLE.0);
        if !unfixable.is_empty() {
            warn!("fsck: uncorrectable defects present: {:#x}", unfixable.0);
            exit_code |= EXIT_UNCORRECTED;
        }

        if defects.contains(CheckFlags::NOVALID) {
            repaired.flags |= FLAG_VALID;
            info!("fsck: restored missing VALID flag");
        }
        if defects.contains(CheckFlags::LASTSB) {
            while repaired.num_superblocks > 1 {
                let last = SuperBlock::location(repaired.num_superblocks - 1) * DEVICE_BLOCK_SIZE
                    + SUPERBLOCK_SIZE as u64;
                if last <= device.size() {
                    break;
                }
                repaired.num_superblocks -= 1;
            }
            info!("fsck: clamped num_superblocks to {} so the last superblock fits", repaired.num_superblocks);
        }
        if defects.contains(CheckFlags::DATASPACE) {
            repaired.data_space =
                device.size().saturating_sub(DEVICE_BLOCK_SIZE * repaired.num_superblocks as u64);
            info!("fsck: recomputed data_space");
        }
        if defects.contains(CheckFlags::MAXLENGTH) {
            repaired.max_length = repaired.data_space.min(repaired.max_length.max(repaired.data_length));
            info!("fsck: clamped max_length");
        }
        if defects.contains(CheckFlags::ALIGNMENT) {
            repaired.alignment = 8;
            info!("fsck: reset alignment to 8");
        }
        if defects.contains(CheckFlags::FLAGS) {
            repaired.flags &= KNOWN_FLAGS;
            info!("fsck: cleared unknown flag bits");
        }

        if defects.0 & FIXABLE.0 != 0 {
            exit_code |= EXIT_CORRECTED;
        }
    }

    repaired.flags &= !FLAG_DIRTY;

    for n in 0..repaired.num_superblocks {
        if SuperBlock::location(n) * DEVICE_BLOCK_SIZE + SUPERBLOCK_SIZE as u64 > device.size() {
            break;
        }
        if let Err(e) = device.write_at(SuperBlock::byte_offset(n), &repaired.encode(n)) {
            warn!("fsck: failed writing superblock {n}: {e}");
            return exit_code | EXIT_OPERATIONAL_ERROR;
        }
    }
    if let Err(e) = device.sync() {
        warn!("fsck: sync failed: {e}");
        return exit_code | EXIT_OPERATIONAL_ERROR;
    }

    if options.repair_records {
        match repair_record_stream(device, &repaired, options) {
            Ok(extra) => exit_code |= extra,
            Err(e) => {
                warn!("fsck: record stream repair failed: {e}");
                exit_code |= EXIT_OPERATIONAL_ERROR;
            }
        }
    }

    exit_code
}

/// Streams every record from `data_start` for `data_length` bytes,
/// replacing any record whose header CRC fails with a synthetic
/// `OVERFLOW`-class marker of identical length so the ring's byte
/// accounting stays intact (spec §4.6 "Optionally performs a full second
/// pass").
fn repair_record_stream(
    device: &mut dyn BlockDevice,
    sb: &SuperBlock,
    options: &FsckOptions,
) -> Result<u32> {
    if !options.assume_yes {
        info!("fsck: record-stream repair declined (assume_yes=false); skipping");
        return Ok(EXIT_CANCELLED);
    }

    let ring = RingMap::new(sb.num_superblocks, sb.data_space);
    let mut cursor = ring.locate(sb.data_start);
    let mut remaining = sb.data_length;
    let mut exit_code = 0u32;

    while remaining > 0 {
        let mut header = vec![0u8; HEADER_SIZE];
        device.read_at(cursor.block * DEVICE_BLOCK_SIZE + cursor.offset as u64, &mut header)?;

        let next_header = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let crc_ok = {
            let crc = crate::crc32::checksum(&header[0..28]);
            let stored = u32::from_le_bytes(header[28..32].try_into().unwrap());
            crc == stored
        };

        if !crc_ok || next_header < HEADER_SIZE as u64 || next_header > remaining {
            if next_header < HEADER_SIZE as u64 || next_header > remaining {
                warn!("fsck: unreadable record length at a corrupt record; stopping stream repair");
                return Ok(exit_code | EXIT_UNCORRECTED);
            }

            warn!("fsck: repairing corrupt record ({next_header} bytes) with a synthetic marker");
            let marker = record::encode_overflow_marker(0, 0);
            let mut replacement = marker;
            replacement.resize(next_header as usize, 0);
            device.write_at(cursor.block * DEVICE_BLOCK_SIZE + cursor.offset as u64, &replacement)?;
            exit_code |= EXIT_CORRECTED;
        }

        cursor = advance_by(&ring, cursor, next_header);
        remaining -= next_header;
    }

    Ok(exit_code)
}

fn advance_by(ring: &RingMap, mut cursor: crate::ring::Cursor, mut n: u64) -> crate::ring::Cursor {
    while n > 0 {
        let remaining_in_block = DEVICE_BLOCK_SIZE - cursor.offset as u64;
        let take = remaining_in_block.min(n);
        cursor = ring.advance(cursor, take);
        n -= take;
    }
    cursor
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::commit;
    use crate::device::MemDevice;

    #[test]
    fn clean_device_is_ok() {
        let mut dev = MemDevice::new(1 << 20);
        commit::format(&mut dev, 8, 16).unwrap();
        assert_eq!(fsck(&mut dev, &FsckOptions::default()), EXIT_OK);
    }

    #[test]
    fn missing_valid_flag_is_corrected() {
        let mut dev = MemDevice::new(1 << 20);
        commit::format(&mut dev, 8, 16).unwrap();

        let mut sb = read_sb_raw(&dev, 0).unwrap();
        sb.flags = 0;
        dev.write_at(SuperBlock::byte_offset(0), &sb.encode(0)).unwrap();

        let code = fsck(&mut dev, &FsckOptions::default());
        assert_eq!(code, EXIT_CORRECTED);

        let repaired = read_sb_raw(&dev, 0).unwrap();
        assert!(repaired.flags & FLAG_VALID != 0);
    }

    #[test]
    fn update_flag_refuses_to_run() {
        let mut dev = MemDevice::new(1 << 20);
        commit::format(&mut dev, 8, 16).unwrap();

        let mut sb = read_sb_raw(&dev, 0).unwrap();
        sb.flags |= FLAG_UPDATE;
        dev.write_at(SuperBlock::byte_offset(0), &sb.encode(0)).unwrap();

        assert_eq!(fsck(&mut dev, &FsckOptions::default()), EXIT_UNCORRECTED);
    }
}
