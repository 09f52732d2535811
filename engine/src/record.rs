//! Log record codec: header + optional credentials + 0–2 names + optional
//! typed payload + alignment padding + CRC (spec §3, §4.3, §6).

use crate::crc32;
use crate::types::{self, ACL, ATTR, CREDS, DATA, DMASK, FILE1, FILE2, FILEID, HASH, REGION, SIZE, XATTR};

pub const HEADER_SIZE: usize = 32;
pub const CREDS_SIZE: usize = 48;
pub const ATTR_SIZE: usize = 48;
pub const REGION_SIZE: usize = 20;
pub const HASH_PAYLOAD_SIZE: usize = REGION_SIZE + 32;

/// The 6 identifiers captured at append time (spec glossary: "Credentials").
/// Kept as `u64` each even though uid/gid are conceptually 32-bit, matching
/// the on-device width given in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u64,
    pub euid: u64,
    pub fsuid: u64,
    pub gid: u64,
    pub egid: u64,
    pub fsgid: u64,
}

impl Credentials {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.euid.to_le_bytes());
        out.extend_from_slice(&self.fsuid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.egid.to_le_bytes());
        out.extend_from_slice(&self.fsgid.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let u = |i: usize| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        Credentials { uid: u(0), euid: u(1), fsuid: u(2), gid: u(3), egid: u(4), fsgid: u(5) }
    }
}

/// A byte region within a file: `(fileid, start, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub fileid: u32,
    pub start: u64,
    pub length: u64,
}

impl Region {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.fileid.to_le_bytes());
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Region {
            fileid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            start: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            length: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        }
    }
}

/// Attribute-change payload (spec §6, 48 B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attr {
    pub flags: u32,
    pub mode: u32,
    pub user: u32,
    pub group: u32,
    /// File size, or (major<<32 | minor) when `flags` carries `BLOCK`/`CHAR`.
    pub size_or_devnum: u64,
    pub atime_sec: u64,
    pub mtime_sec: u64,
    pub atime_nsec: u32,
    pub mtime_nsec: u32,
}

impl Attr {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.user.to_le_bytes());
        out.extend_from_slice(&self.group.to_le_bytes());
        out.extend_from_slice(&self.size_or_devnum.to_le_bytes());
        out.extend_from_slice(&self.atime_sec.to_le_bytes());
        out.extend_from_slice(&self.mtime_sec.to_le_bytes());
        out.extend_from_slice(&self.atime_nsec.to_le_bytes());
        out.extend_from_slice(&self.mtime_nsec.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Attr {
            flags: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            user: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            group: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            size_or_devnum: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            atime_sec: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            mtime_sec: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            atime_nsec: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            mtime_nsec: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        }
    }
}

/// A single ACL entry: the identity it applies to and its permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub id: u32,
    pub perm: u32,
}

/// Combined ACL payload: owning user/group/other/mask bits plus a variable
/// list of named entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    pub user_perm: u32,
    pub group_perm: u32,
    pub other_perm: u32,
    pub mask_perm: u32,
    pub entries: Vec<AclEntry>,
}

impl Acl {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.user_perm.to_le_bytes());
        out.extend_from_slice(&self.group_perm.to_le_bytes());
        out.extend_from_slice(&self.other_perm.to_le_bytes());
        out.extend_from_slice(&self.mask_perm.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.id.to_le_bytes());
            out.extend_from_slice(&e.perm.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 20 {
            return None;
        }
        let user_perm = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let group_perm = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let other_perm = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let mask_perm = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let count = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut pos = 20;
        for _ in 0..count {
            if buf.len() < pos + 8 {
                return None;
            }
            let id = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let perm = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
            entries.push(AclEntry { id, perm });
            pos += 8;
        }
        Some(Acl { user_perm, group_perm, other_perm, mask_perm, entries })
    }

    fn encoded_len(&self) -> usize {
        20 + self.entries.len() * 8
    }
}

/// Extended-attribute payload: name and value are both length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Xattr {
    pub flags: u32,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Xattr {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.value);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 12 {
            return None;
        }
        let flags = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let namelen = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let valuelen = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        if buf.len() < 12 + namelen + valuelen {
            return None;
        }
        let name = buf[12..12 + namelen].to_vec();
        let value = buf[12 + namelen..12 + namelen + valuelen].to_vec();
        Some(Xattr { flags, name, value })
    }

    fn encoded_len(&self) -> usize {
        12 + self.name.len() + self.value.len()
    }
}

/// The one-of typed payload taxonomy (spec §4.3, `SHALL_LOG_DMASK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Attr(Attr),
    Region(Region),
    FileId(u32),
    Size(u64),
    Acl(Acl),
    Xattr(Xattr),
    Hash { region: Region, hash: [u8; 32] },
    Data { region: Region, bytes: Vec<u8> },
}

impl Payload {
    fn flag_bit(&self) -> u32 {
        match self {
            Payload::Attr(_) => ATTR,
            Payload::Region(_) => REGION,
            Payload::FileId(_) => FILEID,
            Payload::Size(_) => SIZE,
            Payload::Acl(_) => ACL,
            Payload::Xattr(_) => XATTR,
            Payload::Hash { .. } => HASH,
            Payload::Data { .. } => DATA,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Payload::Attr(a) => a.encode(out),
            Payload::Region(r) => r.encode(out),
            Payload::FileId(id) => out.extend_from_slice(&id.to_le_bytes()),
            Payload::Size(s) => out.extend_from_slice(&s.to_le_bytes()),
            Payload::Acl(a) => a.encode(out),
            Payload::Xattr(x) => x.encode(out),
            Payload::Hash { region, hash } => {
                region.encode(out);
                out.extend_from_slice(hash);
            }
            Payload::Data { region, bytes } => {
                region.encode(out);
                out.extend_from_slice(bytes);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Payload::Attr(_) => ATTR_SIZE,
            Payload::Region(_) => REGION_SIZE,
            Payload::FileId(_) => 4,
            Payload::Size(_) => 8,
            Payload::Acl(a) => a.encoded_len(),
            Payload::Xattr(x) => x.encoded_len(),
            Payload::Hash { .. } => HASH_PAYLOAD_SIZE,
            Payload::Data { bytes, .. } => REGION_SIZE + bytes.len(),
        }
    }

    fn decode(flag_bit: u32, buf: &[u8]) -> Option<Self> {
        Some(match flag_bit {
            ATTR => {
                if buf.len() < ATTR_SIZE {
                    return None;
                }
                Payload::Attr(Attr::decode(&buf[..ATTR_SIZE]))
            }
            REGION => {
                if buf.len() < REGION_SIZE {
                    return None;
                }
                Payload::Region(Region::decode(&buf[..REGION_SIZE]))
            }
            FILEID => {
                if buf.len() < 4 {
                    return None;
                }
                Payload::FileId(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
            }
            SIZE => {
                if buf.len() < 8 {
                    return None;
                }
                Payload::Size(u64::from_le_bytes(buf[0..8].try_into().unwrap()))
            }
            ACL => Payload::Acl(Acl::decode(buf)?),
            XATTR => Payload::Xattr(Xattr::decode(buf)?),
            HASH => {
                if buf.len() < HASH_PAYLOAD_SIZE {
                    return None;
                }
                let region = Region::decode(&buf[..REGION_SIZE]);
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&buf[REGION_SIZE..REGION_SIZE + 32]);
                Payload::Hash { region, hash }
            }
            DATA => {
                if buf.len() < REGION_SIZE {
                    return None;
                }
                let region = Region::decode(&buf[..REGION_SIZE]);
                Payload::Data { region, bytes: buf[REGION_SIZE..].to_vec() }
            }
            _ => return None,
        })
    }
}

/// A fully decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub operation: i32,
    pub req_sec: u64,
    pub req_nsec: u32,
    pub result: i32,
    pub flags: u32,
    pub creds: Option<Credentials>,
    pub file1: Option<Vec<u8>>,
    pub file2: Option<Vec<u8>>,
    pub payload: Option<Payload>,
}

/// Fields a caller supplies to [`encode_record`]; everything on-device but
/// not caller-relevant (the header's own CRC, `next_header`) is computed
/// internally.
#[derive(Debug, Clone, Default)]
pub struct RecordFields {
    pub operation: i32,
    pub req_sec: u64,
    pub req_nsec: u32,
    pub result: i32,
    pub creds: Option<Credentials>,
    pub file1: Option<Vec<u8>>,
    pub file2: Option<Vec<u8>>,
    pub payload: Option<Payload>,
}

impl RecordFields {
    /// The record's unpadded encoded length — what `next_header` would be
    /// before alignment padding. Used to size a `TOO_BIG` marker's payload
    /// when the record itself cannot be emitted.
    pub fn required_len(&self) -> usize {
        unpadded_len(self)
    }
}

fn unpadded_len(fields: &RecordFields) -> usize {
    let mut len = HEADER_SIZE;
    if fields.creds.is_some() {
        len += CREDS_SIZE;
    }
    if let Some(f1) = &fields.file1 {
        len += 4 + f1.len();
    }
    if let Some(f2) = &fields.file2 {
        len += 4 + f2.len();
    }
    if let Some(p) = &fields.payload {
        len += p.encoded_len();
    }
    len
}

/// Pads `len` up to the next multiple of `alignment`.
pub fn pad_to_alignment(len: usize, alignment: u32) -> usize {
    let alignment = alignment as usize;
    len.div_ceil(alignment) * alignment
}

/// Encodes `fields` into a self-contained, padded, checksummed record
/// (spec §4.3 step 1–3). Returns `None` if the padded record would not fit
/// in `max_len` (the caller — the commit engine — turns that into either a
/// `TooBig` error or a `TOO_BIG` marker per its configured policy).
pub fn encode_record(fields: &RecordFields, alignment: u32, max_len: usize) -> Option<Vec<u8>> {
    let unpadded = unpadded_len(fields);
    let next_header = pad_to_alignment(unpadded, alignment);
    if next_header > max_len {
        return None;
    }

    let mut flags = 0u32;
    if fields.creds.is_some() {
        flags |= CREDS;
    }
    if fields.file1.is_some() {
        flags |= FILE1;
    }
    if fields.file2.is_some() {
        flags |= FILE2;
    }
    if let Some(p) = &fields.payload {
        flags |= p.flag_bit();
    }

    let mut body = Vec::with_capacity(next_header - HEADER_SIZE);
    if let Some(creds) = &fields.creds {
        creds.encode(&mut body);
    }
    if let Some(f1) = &fields.file1 {
        body.extend_from_slice(&(f1.len() as u32).to_le_bytes());
        body.extend_from_slice(f1);
    }
    if let Some(f2) = &fields.file2 {
        body.extend_from_slice(&(f2.len() as u32).to_le_bytes());
        body.extend_from_slice(f2);
    }
    if let Some(p) = &fields.payload {
        p.encode(&mut body);
    }

    let mut out = Vec::with_capacity(next_header);
    out.extend_from_slice(&(next_header as u32).to_le_bytes());
    out.extend_from_slice(&fields.operation.to_le_bytes());
    out.extend_from_slice(&fields.req_sec.to_le_bytes());
    out.extend_from_slice(&fields.req_nsec.to_le_bytes());
    out.extend_from_slice(&fields.result.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());

    let crc = crc32::checksum(&out[0..28]);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    out.resize(next_header, 0);

    Some(out)
}

/// Builds a bare-header `TOO_BIG` marker carrying the size that would have
/// been required, used when `encode_record` refuses a record under the
/// `TooBig = marker` policy.
pub fn encode_too_big_marker(required: u64, alignment: u32) -> Vec<u8> {
    let fields = RecordFields {
        operation: types::encode_operation(types::Operation::TooBig, types::Phase::After),
        req_sec: 0,
        req_nsec: 0,
        result: 0,
        creds: None,
        file1: None,
        file2: None,
        payload: Some(Payload::Size(required)),
    };
    encode_record(&fields, alignment, usize::MAX).expect("marker always fits")
}

/// Builds a bare 32-byte `OVERFLOW` marker header (spec §4.5 step 2).
pub fn encode_overflow_marker(req_sec: u64, req_nsec: u32) -> Vec<u8> {
    let fields = RecordFields {
        operation: types::encode_operation(types::Operation::Overflow, types::Phase::After),
        req_sec,
        req_nsec,
        result: 0,
        creds: None,
        file1: None,
        file2: None,
        payload: None,
    };
    encode_record(&fields, 8, usize::MAX).expect("marker always fits")
}

/// Builds a `RECOVER` marker carrying the dropped count as `result` and the
/// accumulated extra space as a `SIZE` payload (spec §4.5, §4.6).
pub fn encode_recover_marker(num_dropped: u32, extra_space: u64, alignment: u32) -> Vec<u8> {
    let fields = RecordFields {
        operation: types::encode_operation(types::Operation::Recover, types::Phase::After),
        req_sec: 0,
        req_nsec: 0,
        result: num_dropped as i32,
        creds: None,
        file1: None,
        file2: None,
        payload: Some(Payload::Size(extra_space)),
    };
    encode_record(&fields, alignment, usize::MAX).expect("marker always fits")
}

/// Outcome of decoding one record out of a byte stream.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A full, CRC-valid record, plus the number of bytes it occupied.
    Record(Record, usize),
    /// Not enough bytes buffered yet to know `next_header`, let alone the
    /// whole record; caller should read more before retrying.
    Incomplete,
    /// CRC mismatch or structurally invalid encoding.
    Invalid,
}

/// Decodes one record from the front of `buf` (spec §4.3 "Decoding").
///
/// A CRC failure is reported as [`DecodeOutcome::Invalid`] unconditionally;
/// whether that is a hard error (stream head) or a truncation point
/// (mid-stream) is a decision for the caller, since only the caller knows
/// whether any record has already been delivered from this stream.
pub fn parse_record(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < HEADER_SIZE {
        return DecodeOutcome::Incomplete;
    }

    let crc = crc32::checksum(&buf[0..28]);
    let stored_crc = u32::from_le_bytes(buf[28..32].try_into().unwrap());
    if crc != stored_crc {
        return DecodeOutcome::Invalid;
    }

    let next_header = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if next_header < HEADER_SIZE {
        return DecodeOutcome::Invalid;
    }
    if buf.len() < next_header {
        return DecodeOutcome::Incomplete;
    }

    let operation = i32::from_le_bytes(buf[4..8].try_into().unwrap());
    let req_sec = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let req_nsec = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let result = i32::from_le_bytes(buf[20..24].try_into().unwrap());
    let flags = u32::from_le_bytes(buf[24..28].try_into().unwrap());

    let mut pos = HEADER_SIZE;
    let body = &buf[..next_header];

    let creds = if flags & CREDS != 0 {
        if body.len() < pos + CREDS_SIZE {
            return DecodeOutcome::Invalid;
        }
        let c = Credentials::decode(&body[pos..pos + CREDS_SIZE]);
        pos += CREDS_SIZE;
        Some(c)
    } else {
        None
    };

    let mut read_name = |pos: &mut usize| -> Option<Vec<u8>> {
        if body.len() < *pos + 4 {
            return None;
        }
        let len = u32::from_le_bytes(body[*pos..*pos + 4].try_into().unwrap()) as usize;
        *pos += 4;
        if body.len() < *pos + len {
            return None;
        }
        let name = body[*pos..*pos + len].to_vec();
        *pos += len;
        Some(name)
    };

    let file1 = if flags & FILE1 != 0 {
        match read_name(&mut pos) {
            Some(n) => Some(n),
            None => return DecodeOutcome::Invalid,
        }
    } else {
        None
    };

    let file2 = if flags & FILE2 != 0 {
        match read_name(&mut pos) {
            Some(n) => Some(n),
            None => return DecodeOutcome::Invalid,
        }
    } else {
        None
    };

    let payload_bit = flags & DMASK;
    let payload = if payload_bit != 0 {
        match Payload::decode(payload_bit, &body[pos..]) {
            Some(p) => Some(p),
            None => return DecodeOutcome::Invalid,
        }
    } else {
        None
    };

    DecodeOutcome::Record(
        Record { operation, req_sec, req_nsec, result, flags, creds, file1, file2, payload },
        next_header,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_fields() -> RecordFields {
        RecordFields {
            operation: types::encode_operation(types::Operation::Mount, types::Phase::After),
            req_sec: 1234,
            req_nsec: 5678,
            result: 0,
            creds: Some(Credentials { uid: 1, euid: 1, fsuid: 1, gid: 2, egid: 2, fsgid: 2 }),
            file1: Some(b"/tmp/x".to_vec()),
            file2: None,
            payload: None,
        }
    }

    #[test]
    fn roundtrip_with_creds_and_file1() {
        let fields = base_fields();
        let encoded = encode_record(&fields, 8, 4096).unwrap();
        match parse_record(&encoded) {
            DecodeOutcome::Record(rec, len) => {
                assert_eq!(len, encoded.len());
                assert_eq!(rec.operation, fields.operation);
                assert_eq!(rec.file1, fields.file1);
                assert_eq!(rec.creds, fields.creds);
                assert!(rec.flags & FILE1 != 0 && rec.flags & CREDS != 0);
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn padding_respects_alignment() {
        let fields = base_fields();
        let encoded = encode_record(&fields, 64, 4096).unwrap();
        assert_eq!(encoded.len() % 64, 0);
    }

    #[test]
    fn corrupted_header_is_invalid() {
        let fields = base_fields();
        let mut encoded = encode_record(&fields, 8, 4096).unwrap();
        encoded[5] ^= 0xFF;
        assert!(matches!(parse_record(&encoded), DecodeOutcome::Invalid));
    }

    #[test]
    fn truncated_stream_is_incomplete() {
        let fields = base_fields();
        let encoded = encode_record(&fields, 8, 4096).unwrap();
        assert!(matches!(parse_record(&encoded[..10]), DecodeOutcome::Incomplete));
    }

    #[test]
    fn too_big_is_rejected_when_it_cannot_fit() {
        let mut fields = base_fields();
        fields.payload = Some(Payload::Data { region: Region::default(), bytes: vec![0u8; 5000] });
        assert!(encode_record(&fields, 8, 4096).is_none());
    }

    #[test]
    fn data_payload_roundtrip() {
        let mut fields = base_fields();
        fields.file1 = None;
        fields.payload = Some(Payload::Data {
            region: Region { fileid: 7, start: 100, length: 50 },
            bytes: vec![1, 2, 3, 4, 5],
        });
        let encoded = encode_record(&fields, 8, 4096).unwrap();
        match parse_record(&encoded) {
            DecodeOutcome::Record(rec, _) => {
                assert_eq!(
                    rec.payload,
                    Some(Payload::Data {
                        region: Region { fileid: 7, start: 100, length: 50 },
                        bytes: vec![1, 2, 3, 4, 5],
                    })
                );
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }
}
