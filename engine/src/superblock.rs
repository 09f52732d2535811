//! On-device superblock: bit-exact codec, checksum discipline, validity
//! checks, and the superblock-location formula (spec §4.1, §6).
//!
//! The superblock is encoded by hand field-by-field rather than cast
//! through a `#[repr(C, packed)]` struct: the layout has two large
//! untyped reserved runs that a packed struct would still have to zero
//! and skip manually, so nothing is gained by the cast and manual
//! offsets keep the reserved regions impossible to forget.

use crate::crc32;

/// A tiny hand-rolled bitflags macro: this codec's flag sets are all plain
/// `u32` masks with named bits, never need set-algebra beyond `|`/`&`, and
/// pulling in the `bitflags` crate for a couple of small types isn't worth
/// a new dependency.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $($variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        $vis struct $name(pub $ty);

        impl $name {
            $(#[allow(non_upper_case_globals)] pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                $name(self.0 & rhs.0)
            }
        }
    };
}

pub const SUPERBLOCK_SIZE: usize = 1024;
pub const DEVICE_BLOCK_SIZE: u64 = 4096;
pub const MAGIC: &[u8; 8] = b"SHALL 01";

pub const FLAG_VALID: u32 = 1 << 0;
pub const FLAG_DIRTY: u32 = 1 << 1;
pub const FLAG_UPDATE: u32 = 1 << 2;
pub(crate) const KNOWN_FLAGS: u32 = FLAG_VALID | FLAG_DIRTY | FLAG_UPDATE;

/// The 1,024-byte on-device superblock (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub device_size: u64,
    pub data_space: u64,
    pub data_start: u64,
    pub data_length: u64,
    pub max_length: u64,
    pub version: u64,
    pub flags: u32,
    pub alignment: u32,
    pub num_superblocks: u32,
    pub this_superblock: u32,
    pub new_size: u64,
    pub new_alignment: u32,
    pub new_superblocks: u32,
}

impl SuperBlock {
    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub fn is_update(&self) -> bool {
        self.flags & FLAG_UPDATE != 0
    }

    /// Device-block holding superblock `n`: `L(n) = 16n^2 + 4n`.
    pub fn location(n: u32) -> u64 {
        let n = n as u64;
        16 * n * n + 4 * n
    }

    /// Byte offset of superblock `n`'s 1,024-byte structure.
    pub fn byte_offset(n: u32) -> u64 {
        Self::location(n) * DEVICE_BLOCK_SIZE + (DEVICE_BLOCK_SIZE - SUPERBLOCK_SIZE as u64)
    }

    /// Encodes this superblock to its canonical 1,024-byte on-device form,
    /// stamping `this_superblock` and recomputing the trailing CRC.
    pub fn encode(&self, this_superblock: u32) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];

        buf[0..8].copy_from_slice(MAGIC);
        buf[8..16].copy_from_slice(&self.device_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_space.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_start.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_length.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_length.to_le_bytes());
        buf[48..56].copy_from_slice(&self.version.to_le_bytes());
        buf[56..60].copy_from_slice(&self.flags.to_le_bytes());
        buf[60..64].copy_from_slice(&self.alignment.to_le_bytes());
        buf[64..68].copy_from_slice(&self.num_superblocks.to_le_bytes());
        buf[68..72].copy_from_slice(&this_superblock.to_le_bytes());
        // 72..768 reserved, already zero.
        buf[768..776].copy_from_slice(&self.new_size.to_le_bytes());
        buf[776..780].copy_from_slice(&self.new_alignment.to_le_bytes());
        buf[780..784].copy_from_slice(&self.new_superblocks.to_le_bytes());
        // 784..1012 reserved, already zero.
        buf[1012..1020].copy_from_slice(MAGIC);

        let crc = crc32::checksum(&buf[0..1020]);
        buf[1020..1024].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Decodes a 1,024-byte buffer, verifying both magics and the CRC.
    /// Returns `(superblock, this_superblock)` on success. No field-level
    /// consistency checking is done here — that is [`check`].
    pub fn decode(buf: &[u8; SUPERBLOCK_SIZE]) -> Option<(Self, u32)> {
        if &buf[0..8] != MAGIC || &buf[1012..1020] != MAGIC {
            return None;
        }

        let crc = crc32::checksum(&buf[0..1020]);
        let stored_crc = u32::from_le_bytes(buf[1020..1024].try_into().unwrap());
        if crc != stored_crc {
            return None;
        }

        let sb = SuperBlock {
            device_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            data_space: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            data_start: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            data_length: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            max_length: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            version: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            alignment: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            num_superblocks: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
            this_superblock: u32::from_le_bytes(buf[68..72].try_into().unwrap()),
            new_size: u64::from_le_bytes(buf[768..776].try_into().unwrap()),
            new_alignment: u32::from_le_bytes(buf[776..780].try_into().unwrap()),
            new_superblocks: u32::from_le_bytes(buf[780..784].try_into().unwrap()),
        };
        let this_superblock = sb.this_superblock;
        Some((sb, this_superblock))
    }
}

bitflags_like! {
    /// Independently-signalled defects a superblock may have (spec §4.1).
    /// Plain bitmask rather than the `bitflags` crate: every other
    /// low-level on-device flag set in this codec (record flags, superblock
    /// flags) is a hand-named `u32` mask, so this stays consistent with
    /// them rather than introducing a second convention for one type.
    pub struct CheckFlags: u32 {
        NOVALID = 1 << 0;
        TOOBIG = 1 << 1;
        TOOSMALL = 1 << 2;
        NONBLOCK = 1 << 3;
        DATASPACE = 1 << 4;
        DATASTART = 1 << 5;
        DATALENGTH = 1 << 6;
        MAXLENGTH = 1 << 7;
        ALIGNMENT = 1 << 8;
        LASTSB = 1 << 9;
        FLAGS = 1 << 10;
    }
}

/// Defects a repair tool is allowed to silently fix.
pub const FIXABLE: CheckFlags = CheckFlags(
    CheckFlags::NOVALID.0
        | CheckFlags::DATASPACE.0
        | CheckFlags::MAXLENGTH.0
        | CheckFlags::ALIGNMENT.0
        | CheckFlags::LASTSB.0
        | CheckFlags::FLAGS.0,
);

const MIN_DEVICE_SIZE: u64 = 65_536;
const MIN_SUPERBLOCKS: u32 = 9;

/// Full consistency check of a decoded superblock (spec §4.1).
///
/// `physical_size`, if known, additionally checks `device_size` against
/// the real size of the backing device (`TOOBIG`); pass `None` when the
/// caller has no independent size to compare against.
pub fn check_sb(sb: &SuperBlock, physical_size: Option<u64>) -> CheckFlags {
    let mut flags = CheckFlags::empty();

    if !sb.is_valid() {
        flags |= CheckFlags::NOVALID;
    }
    if let Some(phys) = physical_size {
        if sb.device_size > phys {
            flags |= CheckFlags::TOOBIG;
        }
    }
    if sb.device_size < MIN_DEVICE_SIZE || sb.num_superblocks <= 8 {
        flags |= CheckFlags::TOOSMALL;
    }
    if sb.num_superblocks < MIN_SUPERBLOCKS {
        flags |= CheckFlags::TOOSMALL;
    }
    if sb.device_size % DEVICE_BLOCK_SIZE != 0 {
        flags |= CheckFlags::NONBLOCK;
    }
    if sb.data_space + DEVICE_BLOCK_SIZE * sb.num_superblocks as u64 != sb.device_size {
        flags |= CheckFlags::DATASPACE;
    }
    if sb.data_start >= sb.data_space {
        flags |= CheckFlags::DATASTART;
    }
    if sb.data_length > sb.data_space || sb.data_length > sb.max_length {
        flags |= CheckFlags::DATALENGTH;
    }
    if sb.max_length > sb.data_space || sb.max_length < sb.data_length {
        flags |= CheckFlags::MAXLENGTH;
    }
    if sb.alignment < 8 || sb.alignment > 4096 || sb.alignment % 8 != 0 {
        flags |= CheckFlags::ALIGNMENT;
    }
    if sb.num_superblocks > 0 {
        let last = SuperBlock::location(sb.num_superblocks - 1) * DEVICE_BLOCK_SIZE
            + SUPERBLOCK_SIZE as u64;
        if last > sb.device_size {
            flags |= CheckFlags::LASTSB;
        }
    }
    if sb.flags & !KNOWN_FLAGS != 0 {
        flags |= CheckFlags::FLAGS;
    }

    flags
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> SuperBlock {
        SuperBlock {
            device_size: 1 << 20,
            data_space: (1 << 20) - DEVICE_BLOCK_SIZE * 16,
            data_start: 0,
            data_length: 0,
            max_length: 0,
            version: 1,
            flags: FLAG_VALID,
            alignment: 8,
            num_superblocks: 16,
            this_superblock: 0,
            new_size: 0,
            new_alignment: 0,
            new_superblocks: 0,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let sb = sample();
        let encoded = sb.encode(3);
        let (decoded, index) = SuperBlock::decode(&encoded).unwrap();
        assert_eq!(index, 3);
        assert_eq!(decoded.device_size, sb.device_size);
        assert_eq!(decoded.version, sb.version);
        assert_eq!(decoded.flags, sb.flags);
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let sb = sample();
        let mut encoded = sb.encode(0);
        encoded[10] ^= 0xFF;
        assert!(SuperBlock::decode(&encoded).is_none());
    }

    #[test]
    fn location_formula() {
        assert_eq!(SuperBlock::location(0), 0);
        assert_eq!(SuperBlock::location(1), 20);
        assert_eq!(SuperBlock::location(2), 72);
    }

    #[test]
    fn clean_superblock_has_no_defects() {
        let sb = sample();
        assert!(check_sb(&sb, Some(sb.device_size)).is_empty());
    }

    #[test]
    fn missing_valid_bit_is_flagged_and_fixable() {
        let mut sb = sample();
        sb.flags = 0;
        let flags = check_sb(&sb, None);
        assert!(flags.contains(CheckFlags::NOVALID));
        assert!(FIXABLE.contains(CheckFlags::NOVALID));
    }

    #[test]
    fn inconsistent_data_space_is_flagged() {
        let mut sb = sample();
        sb.data_space += 1;
        assert!(check_sb(&sb, None).contains(CheckFlags::DATASPACE));
    }
}
