//! Operation codes and record flag bits shared by the codec, commit engine,
//! and consumer reader (spec §6).

/// A logged operation.
///
/// The sign of the encoded `operation` field (not of this type, which is
/// always stored as its positive magnitude) distinguishes a before-op
/// record from an after-op one: negative magnitude is "before", positive
/// is "after", and the reserved value `0` (`Debug`) is neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Operation {
    Debug = 0,
    Mount = 1,
    Remount = 2,
    Umount = 3,
    Overflow = 4,
    Recover = 5,
    TooBig = 6,
    Meta = 7,
    Mknod = 8,
    Mkdir = 9,
    Link = 10,
    Symlink = 11,
    Create = 12,
    Delete = 13,
    Rmdir = 14,
    Open = 15,
    Write = 16,
    Commit = 17,
    Close = 18,
    Move = 19,
    Swap = 20,
    SetAcl = 21,
    SetXattr = 22,
    DelXattr = 23,
    UserLog = 24,
}

impl Operation {
    /// Recovers an `Operation` from the magnitude of an encoded `operation`
    /// field (the sign carries before/after, not identity).
    pub fn from_magnitude(v: i32) -> Option<Self> {
        use Operation::*;
        Some(match v {
            0 => Debug,
            1 => Mount,
            2 => Remount,
            3 => Umount,
            4 => Overflow,
            5 => Recover,
            6 => TooBig,
            7 => Meta,
            8 => Mknod,
            9 => Mkdir,
            10 => Link,
            11 => Symlink,
            12 => Create,
            13 => Delete,
            14 => Rmdir,
            15 => Open,
            16 => Write,
            17 => Commit,
            18 => Close,
            19 => Move,
            20 => Swap,
            21 => SetAcl,
            22 => SetXattr,
            23 => DelXattr,
            24 => UserLog,
            _ => return None,
        })
    }
}

/// Whether a record describes the state before or after the operation it
/// names. `Debug` records (operation magnitude 0) carry neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
    Debug,
}

/// Splits an encoded `operation` field into its operation and phase.
pub fn decode_operation(encoded: i32) -> Option<(Operation, Phase)> {
    let phase = match encoded.signum() {
        0 => Phase::Debug,
        -1 => Phase::Before,
        _ => Phase::After,
    };
    Operation::from_magnitude(encoded.unsigned_abs() as i32).map(|op| (op, phase))
}

/// Encodes an operation and phase back into the signed `operation` field.
pub fn encode_operation(op: Operation, phase: Phase) -> i32 {
    let mag = op as i32;
    match phase {
        Phase::Before => -mag,
        Phase::After => mag,
        Phase::Debug => 0,
    }
}

/// Record flag: a name for the first named file follows.
pub const FILE1: u32 = 0x0001;
/// Record flag: a name for the second named file follows (e.g. rename target).
pub const FILE2: u32 = 0x0002;
/// Record flag: the 48-byte credentials block is present.
pub const CREDS: u32 = 0x0004;

/// Record flag: `FILEID` payload present.
pub const FILEID: u32 = 0x0100;
/// Record flag: `ATTR` payload present.
pub const ATTR: u32 = 0x0200;
/// Record flag: `XATTR` payload present.
pub const XATTR: u32 = 0x0400;
/// Record flag: `REGION` payload present.
pub const REGION: u32 = 0x0800;
/// Record flag: `SIZE` payload present.
pub const SIZE: u32 = 0x1000;
/// Record flag: `ACL` payload present.
pub const ACL: u32 = 0x2000;
/// Record flag: `HASH` payload present.
pub const HASH: u32 = 0x4000;
/// Record flag: `DATA` payload present.
pub const DATA: u32 = 0x8000;

/// Mask selecting the (at most one) typed-payload bit.
pub const DMASK: u32 = 0xFF00;

/// Attribute-payload sub-flags (packed into the `ATTR` payload's own `flags`
/// field, distinct from the record-level flags above).
pub mod attr_flags {
    pub const MODE: u32 = 0x01;
    pub const USER: u32 = 0x02;
    pub const GROUP: u32 = 0x04;
    pub const BLOCK: u32 = 0x08;
    pub const CHAR: u32 = 0x10;
    pub const SIZE: u32 = 0x20;
    pub const ATIME: u32 = 0x40;
    pub const MTIME: u32 = 0x80;
    pub const EXCL: u32 = 0x100;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_every_operation() {
        for mag in 0..=24 {
            let op = Operation::from_magnitude(mag).unwrap();
            assert_eq!(op as i32, mag);
        }
        assert!(Operation::from_magnitude(25).is_none());
    }

    #[test]
    fn phase_follows_sign() {
        let (op, phase) = decode_operation(-(Operation::Write as i32)).unwrap();
        assert_eq!(op, Operation::Write);
        assert_eq!(phase, Phase::Before);

        let (op, phase) = decode_operation(Operation::Write as i32).unwrap();
        assert_eq!(op, Operation::Write);
        assert_eq!(phase, Phase::After);

        let (op, phase) = decode_operation(0).unwrap();
        assert_eq!(op, Operation::Debug);
        assert_eq!(phase, Phase::Debug);
    }

    #[test]
    fn encode_decode_operation_roundtrip() {
        let encoded = encode_operation(Operation::Mkdir, Phase::Before);
        assert_eq!(decode_operation(encoded), Some((Operation::Mkdir, Phase::Before)));
    }
}
