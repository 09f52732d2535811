//! Process-wide mount registry (spec §9 "Global mount registry").
//!
//! The source keeps a doubly-linked list across the kernel module and
//! notes the list-traversal race that results; this is a concurrent map
//! keyed by device identifier instead, with explicit register/unregister
//! rather than implicit list splicing.

use std::collections::HashMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use crate::commit::Engine;
use crate::error::{Error, Result};

/// Identifies the underlying device independent of how many times it has
/// been opened, mirroring `stat(2)`'s `st_rdev` (block/char devices) or
/// `st_dev` (plain files, e.g. the loopback-free test harness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn of_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let id = if meta.file_type().is_block_device() || meta.file_type().is_char_device() {
            meta.rdev()
        } else {
            meta.dev()
        };
        Ok(DeviceId(id))
    }
}

fn registry() -> &'static Mutex<HashMap<DeviceId, Arc<Engine>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<DeviceId, Arc<Engine>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a freshly mounted engine under `id`. Refuses a second
/// concurrent mount of the same device (spec §7 `Busy`).
pub fn register(id: DeviceId, engine: Arc<Engine>) -> Result<()> {
    let mut map = registry().lock().unwrap();
    if map.contains_key(&id) {
        return Err(Error::Busy);
    }
    map.insert(id, engine);
    Ok(())
}

/// Looks up the engine currently mounted for `id`, if any.
pub fn lookup(id: DeviceId) -> Option<Arc<Engine>> {
    registry().lock().unwrap().get(&id).cloned()
}

/// Removes `id` from the registry, returning the engine that was mounted
/// there. Called once the engine's final unmount flush has completed.
pub fn unregister(id: DeviceId) -> Option<Arc<Engine>> {
    registry().lock().unwrap().remove(&id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::commit::{self, MountOptions};
    use crate::device::MemDevice;

    #[test]
    fn register_refuses_a_second_mount_of_the_same_id() {
        let mut dev_a = MemDevice::new(1 << 20);
        commit::format(&mut dev_a, 8, 16).unwrap();
        let engine_a = Engine::mount(Box::new(dev_a), MountOptions::default()).unwrap();

        let id = DeviceId(42);
        register(id, engine_a.clone()).unwrap();
        assert!(matches!(register(id, engine_a.clone()), Err(Error::Busy)));

        assert!(lookup(id).is_some());
        unregister(id);
        assert!(lookup(id).is_none());

        engine_a.unmount().unwrap();
    }
}
