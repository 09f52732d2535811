//! SHALLFS journal engine: a ring-buffered, self-describing, checksummed
//! modification-log filesystem component.
//!
//! This crate implements every piece named in spec §2 — device layout and
//! superblock codec, ring buffer addressing, log record codec, the commit
//! engine, the overflow/back-pressure controller, and the consumer
//! reader/admin surface — plus the process-wide mount registry and the
//! out-of-mount fsck/repair pass. It has no knowledge of VFS plumbing,
//! inodes, or symlinks; callers that need those build them on top of
//! [`Engine`].

pub mod crc32;
pub mod device;
pub mod error;
pub mod fsck;
pub mod overflow;
pub mod record;
pub mod registry;
pub mod ring;
pub mod superblock;
pub mod types;
pub mod util;

mod commit;
mod reader;

pub use commit::{Engine, FlushReason, MountOptions, TooBigPolicy, format};
pub use error::{Error, Result};
pub use overflow::{OverflowAction, OverflowPolicy, OverflowState};
pub use record::{
    Acl, AclEntry, Attr, Credentials, DecodeOutcome, Payload, Record, RecordFields, Region, Xattr,
    encode_record, pad_to_alignment, parse_record,
};
pub use registry::DeviceId;
pub use types::{Operation, Phase, decode_operation, encode_operation};
