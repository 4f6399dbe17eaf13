//! Process-wide device table.
//!
//! Drivers register a creator; the first lookup runs every creator once
//! and freezes the table. Later lookups only read it, and the table is
//! never enumerated again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use nnrt_core::{Device, DeviceId, DeviceInfo, NnrtError, NnrtResult};
use nnrt_device::{DeviceV1, DeviceV2};
use nnrt_proto::hdi::{v1, v2};
use tracing::{info, warn};

use crate::identity::device_id;

/// Connects one device; called once, during enumeration.
pub type DeviceCreator = Box<dyn Fn() -> NnrtResult<Arc<dyn Device>> + Send + Sync>;

#[derive(Default)]
struct Creators {
    pending: Vec<(String, DeviceCreator)>,
    sealed: bool,
}

#[derive(Default)]
pub struct DeviceManager {
    creators: Mutex<Creators>,
    devices: OnceLock<BTreeMap<DeviceId, Arc<dyn Device>>>,
}

static GLOBAL_MANAGER: OnceLock<Arc<DeviceManager>> = OnceLock::new();

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager shared by every compilation that does not bring its own.
    pub fn global() -> Arc<DeviceManager> {
        Arc::clone(GLOBAL_MANAGER.get_or_init(|| Arc::new(DeviceManager::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Creators> {
        match self.creators.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, name: impl Into<String>, creator: DeviceCreator) -> NnrtResult<()> {
        let name = name.into();
        let mut creators = self.lock();
        if creators.sealed {
            return Err(NnrtError::forbidden(format!(
                "cannot register {name}: devices were already enumerated"
            )));
        }
        creators.pending.push((name, creator));
        Ok(())
    }

    pub fn register_v1(&self, name: impl Into<String>, driver: Arc<dyn v1::Driver>) -> NnrtResult<()> {
        self.register(
            name,
            Box::new(move || Ok(Arc::new(DeviceV1::new(Arc::clone(&driver))?) as Arc<dyn Device>)),
        )
    }

    pub fn register_v2(&self, name: impl Into<String>, driver: Arc<dyn v2::Driver>) -> NnrtResult<()> {
        self.register(
            name,
            Box::new(move || Ok(Arc::new(DeviceV2::new(Arc::clone(&driver))?) as Arc<dyn Device>)),
        )
    }

    fn table(&self) -> &BTreeMap<DeviceId, Arc<dyn Device>> {
        self.devices.get_or_init(|| {
            let mut creators = self.lock();
            creators.sealed = true;
            let mut devices = BTreeMap::new();
            for (name, creator) in creators.pending.drain(..) {
                let device = match creator() {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(%name, %err, "device skipped");
                        continue;
                    }
                };
                let id = device_id(device.info());
                if devices.contains_key(&id) {
                    warn!(%name, %id, "duplicate device skipped");
                    continue;
                }
                info!(%name, %id, device = %device.info().name, "device enumerated");
                devices.insert(id, device);
            }
            devices
        })
    }

    /// Every enumerated device, in id order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.table().keys().copied().collect()
    }

    pub fn device(&self, id: DeviceId) -> NnrtResult<Arc<dyn Device>> {
        self.table()
            .get(&id)
            .cloned()
            .ok_or_else(|| NnrtError::invalid_argument(format!("no device with id {id}")))
    }

    pub fn info(&self, id: DeviceId) -> NnrtResult<DeviceInfo> {
        Ok(self.device(id)?.info().clone())
    }

    /// Looks a device up by the name it reports.
    pub fn find(&self, name: &str) -> Option<DeviceId> {
        self.table()
            .iter()
            .find(|(_, device)| device.info().name == name)
            .map(|(id, _)| *id)
    }
}
