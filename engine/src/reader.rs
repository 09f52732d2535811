//! Consumer reader and admin control-channel surface (spec §4.6).
//!
//! Reads hold the engine mutex for the whole call rather than releasing
//! it per physical block the way [`Engine`]'s flush loop does. The
//! source's scatter-read design (spec §9) avoids the copy this makes;
//! this implementation takes the straightforward copying path and is
//! documented as a deliberate simplification (see `DESIGN.md`) rather
//! than a faithful port of the zero-copy interface.

use std::sync::MutexGuard;

use log::info;

use crate::commit::{Engine, Inner};
use crate::error::{Error, Result};
use crate::record::{self, HEADER_SIZE};
use crate::ring::Cursor;
use crate::superblock::DEVICE_BLOCK_SIZE;
use crate::types::{Operation, Phase, encode_operation};
use crate::util::now_unix;

impl Engine {
    /// Reads as many whole records as fit in `buf`, returning the number
    /// of bytes written (spec §4.6 `read_records`).
    pub fn read_records(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.logs_valid() {
            return Ok(0);
        }

        let guard = self.inner().lock().unwrap();
        let mut cursor = guard.start_ptr();
        let mut consumed_rel = 0u64;
        let mut out_pos = 0usize;
        let mut delivered = 0usize;
        let data_length = guard.data_length();

        let result = loop {
            if consumed_rel >= data_length {
                break Ok(());
            }

            let (header, header_cursor) =
                match self.read_ring_bytes(&guard, cursor, consumed_rel, HEADER_SIZE) {
                    Ok(v) => v,
                    Err(e) => break Err(e),
                };
            let next_header = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            if next_header < HEADER_SIZE {
                break if delivered == 0 { Err(Error::Invalid) } else { Ok(()) };
            }

            let rest_len = next_header - HEADER_SIZE;
            let (rest, new_cursor) = match self.read_ring_bytes(
                &guard,
                header_cursor,
                consumed_rel + HEADER_SIZE as u64,
                rest_len,
            ) {
                Ok(v) => v,
                Err(e) => break Err(e),
            };

            let mut full = header;
            full.extend_from_slice(&rest);

            match record::parse_record(&full) {
                record::DecodeOutcome::Record(_, len) => {
                    if out_pos + len > buf.len() {
                        break Ok(());
                    }
                    buf[out_pos..out_pos + len].copy_from_slice(&full[..len]);
                    out_pos += len;
                    delivered += 1;
                    consumed_rel += len as u64;
                    cursor = new_cursor;
                }
                record::DecodeOutcome::Invalid => {
                    break if delivered == 0 { Err(Error::Invalid) } else { Ok(()) };
                }
                record::DecodeOutcome::Incomplete => break Ok(()),
            }
        };

        drop(guard);
        let mut guard = self.inner().lock().unwrap();

        result?;

        if consumed_rel > 0 {
            guard.set_start_ptr(cursor);
            guard.set_data_start(cursor.logical);
            guard.shrink_data_length(consumed_rel);
        }
        drop(guard);

        if consumed_rel > 0 && self.overflow().num_dropped() > 0 {
            self.emit_recover_marker()?;
        }

        Ok(out_pos)
    }

    /// Advances the read cursor past exactly `n_bytes` of whole records
    /// without copying any data out (spec §4.6 `discard`, the `clear`
    /// admin command). A partial record at the tail is never consumed.
    pub fn discard(&self, n_bytes: u64) -> Result<u64> {
        let guard = self.inner().lock().unwrap();
        let mut cursor = guard.start_ptr();
        let mut consumed_rel = 0u64;
        let data_length = guard.data_length();

        while consumed_rel < data_length {
            let (header, header_cursor) =
                self.read_ring_bytes(&guard, cursor, consumed_rel, HEADER_SIZE)?;
            let next_header = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            if next_header < HEADER_SIZE || consumed_rel + next_header as u64 > n_bytes {
                break;
            }
            let (_, new_cursor) = self.read_ring_bytes(
                &guard,
                header_cursor,
                consumed_rel + HEADER_SIZE as u64,
                next_header - HEADER_SIZE,
            )?;
            cursor = new_cursor;
            consumed_rel += next_header as u64;
        }

        drop(guard);
        let mut guard = self.inner().lock().unwrap();
        if consumed_rel > 0 {
            guard.set_start_ptr(cursor);
            guard.set_data_start(cursor.logical);
            guard.shrink_data_length(consumed_rel);
        }
        Ok(consumed_rel)
    }

    /// Parses and dispatches one newline-stripped admin command (spec
    /// §4.6 "Admin commands"). Returns `Error::Invalid` for anything else.
    pub fn admin_command(&self, line: &str) -> Result<()> {
        let line = line.trim_end_matches(['\n', '\r']);

        if line == "commit" {
            return self.commit();
        }
        if let Some(rest) = line.strip_prefix("clear ") {
            let n: u64 = rest.trim().parse().map_err(|_| Error::Invalid)?;
            self.discard(n)?;
            return Ok(());
        }
        if let Some(text) = line.strip_prefix("userlog ") {
            if text.len() > 128 {
                return Err(Error::Invalid);
            }
            let (sec, nsec) = now_unix();
            return self.append(record::RecordFields {
                operation: encode_operation(Operation::UserLog, Phase::After),
                req_sec: sec,
                req_nsec: nsec,
                result: 0,
                creds: None,
                file1: Some(text.as_bytes().to_vec()),
                file2: None,
                payload: None,
            });
        }
        Err(Error::Invalid)
    }

    /// Emits the paired `RECOVER` marker once a drain has freed space
    /// behind an earlier `OVERFLOW` (spec §4.5, §4.6).
    fn emit_recover_marker(&self) -> Result<()> {
        let (dropped, extra) = self.overflow().take_for_recovery();
        if dropped == 0 {
            return Ok(());
        }
        let alignment = self.inner().lock().unwrap().alignment();
        info!("recovered from overflow: {dropped} dropped, {extra} bytes");
        let marker = record::encode_recover_marker(dropped, extra, alignment);
        self.append_raw(marker)?;
        self.log_queue().notify_all();
        Ok(())
    }

    /// Reads `n` bytes starting at `(cursor, consumed_rel)` off whichever
    /// backing store currently holds them — the on-device committed
    /// region, the in-memory unflushed buffer tail, or (rarely) a run
    /// that straddles the two — and returns the bytes plus the cursor
    /// advanced past them.
    fn read_ring_bytes(
        &self,
        guard: &MutexGuard<'_, Inner>,
        mut cursor: Cursor,
        consumed_rel: u64,
        n: usize,
    ) -> Result<(Vec<u8>, Cursor)> {
        let committed = guard.committed();
        let mut out = Vec::with_capacity(n);
        let mut remaining = n;
        let mut rel = consumed_rel;

        while remaining > 0 {
            if rel < committed {
                let take = ((DEVICE_BLOCK_SIZE as u32 - cursor.offset) as usize)
                    .min(remaining)
                    .min((committed - rel) as usize);
                let mut chunk = vec![0u8; take];
                {
                    let device = self.device().lock().unwrap();
                    device.read_at(cursor.block * DEVICE_BLOCK_SIZE + cursor.offset as u64, &mut chunk)?;
                }
                cursor = self.ring().advance(cursor, take as u64);
                out.extend_from_slice(&chunk);
                remaining -= take;
                rel += take as u64;
            } else {
                let local_start = guard.buffer_read() + (rel - committed) as usize;
                let take = remaining;
                out.extend_from_slice(guard.buffer_bytes_at(local_start, take));
                cursor = self.ring().advance(cursor, take as u64);
                remaining = 0;
                rel += take as u64;
            }
        }

        Ok((out, cursor))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::commit::MountOptions;
    use crate::device::{BlockDevice, MemDevice};
    use crate::types::{Operation, Phase, encode_operation};

    fn formatted_device(size: u64) -> MemDevice {
        let mut dev = MemDevice::new(size);
        crate::commit::format(&mut dev, 8, 16).unwrap();
        dev
    }

    #[test]
    fn append_then_drain_roundtrip() {
        let dev = formatted_device(1 << 20);
        let engine = Engine::mount(Box::new(dev), MountOptions::default()).unwrap();

        engine
            .append(record::RecordFields {
                operation: encode_operation(Operation::Mount, Phase::After),
                req_sec: 1,
                req_nsec: 0,
                result: 0,
                creds: None,
                file1: Some(b"/tmp/x".to_vec()),
                file2: None,
                payload: None,
            })
            .unwrap();

        engine.commit().unwrap();

        let mut buf = [0u8; 4096];
        let n = engine.read_records(&mut buf).unwrap();
        assert!(n > 0);
        match record::parse_record(&buf[..n]) {
            record::DecodeOutcome::Record(rec, _) => {
                assert_eq!(rec.file1, Some(b"/tmp/x".to_vec()));
            }
            other => panic!("expected a record: {other:?}"),
        }

        engine.unmount().unwrap();
    }
}
