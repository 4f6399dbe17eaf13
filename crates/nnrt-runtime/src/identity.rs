//! Stable hashes for devices and for the hardware the process runs on.

use std::path::Path;

use nnrt_core::{DeviceClass, DeviceInfo, DeviceId, DriverGeneration};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Environment override for the hardware name.
pub const HARDWARE_NAME_ENV: &str = "NNRT_HARDWARE_NAME";
const DMI_PRODUCT_NAME: &str = "/sys/devices/virtual/dmi/id/product_name";

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Identity of a connected device, over its name, vendor, class and
/// driver generation. The driver version is left out.
pub fn device_id(info: &DeviceInfo) -> DeviceId {
    let mut hash = fnv1a_bytes(fnv1a_init(), info.name.as_bytes());
    hash = fnv1a_bytes(hash, &[0]);
    hash = fnv1a_bytes(hash, info.vendor.as_bytes());
    let class = match info.class {
        DeviceClass::Other => 0u8,
        DeviceClass::Cpu => 1,
        DeviceClass::Gpu => 2,
        DeviceClass::Accelerator => 3,
    };
    let generation = match info.generation {
        DriverGeneration::V1 => 1u8,
        DriverGeneration::V2 => 2,
    };
    DeviceId(fnv1a_bytes(hash, &[0, class, 0, generation]))
}

/// Platform hardware name: environment override, then DMI, then `"unknown"`.
pub fn hardware_name() -> String {
    if let Ok(name) = std::env::var(HARDWARE_NAME_ENV) {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    read_trimmed(Path::new(DMI_PRODUCT_NAME)).unwrap_or_else(|| "unknown".to_string())
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Hash tagging caches written on this hardware.
pub fn hardware_hash() -> u64 {
    fnv1a_hash(hardware_name().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn generations_get_distinct_ids() {
        let mut info = DeviceInfo {
            name: "ref-cpu".to_string(),
            vendor: "nnrt".to_string(),
            version: "0.1.0".to_string(),
            class: DeviceClass::Cpu,
            generation: DriverGeneration::V1,
        };
        let v1 = device_id(&info);
        info.generation = DriverGeneration::V2;
        let v2 = device_id(&info);
        assert_ne!(v1, v2);
        info.version = "9.9.9".to_string();
        assert_eq!(device_id(&info), v2);
        info.class = DeviceClass::Gpu;
        assert_ne!(device_id(&info), v2);
    }
}
