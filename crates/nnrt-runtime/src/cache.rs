//! On-disk persistence of prepared models.
//!
//! A cache is a record file `<dir>/<token>cache_info.nncache` plus data
//! files `<dir>/<token><i>.nncache`. The record is JSON:
//!
//! ```text
//! {"data":{"deviceId":..,"fileNumber":..,"version":..,"modelCheckSum":[..]},"CheckSum":..}
//! ```
//!
//! `CheckSum` covers the serialized `data` object; `modelCheckSum` holds
//! one checksum per data file. Data files are written before the record,
//! so a record only exists once every file it names is complete.

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use nnrt_core::{ErrorKind, NnrtError, NnrtResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CACHE_EXTENSION: &str = "nncache";
pub const MAX_CACHE_FILES: usize = 100;

/// 16-bit one's-complement checksum over little-endian words.
///
/// An odd trailing byte counts as a word with a zero high byte.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in bytes.chunks(2) {
        let word = match chunk {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            [lo] => u16::from(*lo),
            _ => 0,
        };
        sum += u32::from(word);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RecordData {
    #[serde(rename = "deviceId")]
    device_id: u64,
    #[serde(rename = "fileNumber")]
    file_number: u64,
    version: u64,
    #[serde(rename = "modelCheckSum")]
    model_checksum: Vec<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    data: RecordData,
    #[serde(rename = "CheckSum")]
    checksum: u16,
}

fn record_checksum(data: &RecordData) -> NnrtResult<u16> {
    let body = serde_json::to_vec(data)
        .map_err(|err| NnrtError::failed(format!("failed to encode cache record: {err}")))?;
    Ok(checksum(&body))
}

/// Contents of a cache record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub file_count: usize,
    pub version: u64,
    pub device_hash: u64,
    pub file_checksums: Vec<u16>,
}

impl From<RecordData> for CacheInfo {
    fn from(data: RecordData) -> Self {
        Self {
            file_count: data.file_number as usize,
            version: data.version,
            device_hash: data.device_id,
            file_checksums: data.model_checksum,
        }
    }
}

/// One cache location: directory, file-name token and the identity
/// hash of the hardware reading or writing it.
#[derive(Clone, Debug)]
pub struct ModelCache {
    dir: PathBuf,
    token: String,
    device_hash: u64,
}

impl ModelCache {
    pub fn new(dir: impl Into<PathBuf>, token: impl Into<String>, device_hash: u64) -> Self {
        Self {
            dir: dir.into(),
            token: token.into(),
            device_hash,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}cache_info.{CACHE_EXTENSION}", self.token))
    }

    pub fn data_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{}{index}.{CACHE_EXTENSION}", self.token))
    }

    /// Reads the record without checking it against anything.
    pub fn inspect(&self) -> NnrtResult<CacheInfo> {
        Ok(self.read_record()?.data.into())
    }

    fn read_record(&self) -> NnrtResult<Record> {
        let path = self.record_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(NnrtError::invalid_path(format!(
                    "no cache record at {}",
                    path.display()
                )))
            }
            Err(err) => {
                return Err(NnrtError::invalid_file(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&raw).map_err(|err| {
            NnrtError::invalid_file(format!("malformed cache record {}: {err}", path.display()))
        })
    }

    /// Checks the record and every data file it names.
    ///
    /// A record written by a newer version is left in place; any other
    /// rejection deletes the record so the next store starts clean.
    pub fn validate(&self, expected_version: u64) -> NnrtResult<CacheInfo> {
        let record = match self.read_record() {
            Ok(record) => record,
            Err(err) if err.kind() == ErrorKind::InvalidPath => return Err(err),
            Err(err) => return Err(self.discard(err)),
        };

        if record_checksum(&record.data)? != record.checksum {
            return Err(self.discard(NnrtError::invalid_file("cache record checksum mismatch")));
        }
        let data = record.data;
        if data.version > expected_version {
            return Err(NnrtError::invalid_argument(format!(
                "cache version {} is newer than the requested {expected_version}",
                data.version
            )));
        }
        if data.device_id != self.device_hash {
            return Err(self.discard(NnrtError::failed(
                "cache was produced on different hardware",
            )));
        }
        let count = data.file_number as usize;
        if !(1..=MAX_CACHE_FILES).contains(&count) || data.model_checksum.len() != count {
            return Err(self.discard(NnrtError::invalid_file(format!(
                "cache record names {count} files with {} checksums",
                data.model_checksum.len()
            ))));
        }
        if data.version < expected_version {
            return Err(self.discard(NnrtError::failed(format!(
                "cache version {} is stale, expected {expected_version}",
                data.version
            ))));
        }

        let info = CacheInfo::from(data);
        if let Err(err) = self.read_data(&info) {
            return Err(self.discard(err));
        }
        debug!(dir = %self.dir.display(), files = count, "cache record validated");
        Ok(info)
    }

    /// Reads the data files a validated record names.
    pub fn load(&self, info: &CacheInfo) -> NnrtResult<Vec<Bytes>> {
        self.read_data(info)
    }

    fn read_data(&self, info: &CacheInfo) -> NnrtResult<Vec<Bytes>> {
        (0..info.file_count)
            .map(|index| {
                let path = self.data_path(index);
                let bytes = fs::read(&path).map_err(|err| {
                    NnrtError::invalid_file(format!("failed to read {}: {err}", path.display()))
                })?;
                let expected = info.file_checksums.get(index).copied();
                if expected != Some(checksum(&bytes)) {
                    return Err(NnrtError::invalid_file(format!(
                        "{} does not match its recorded checksum",
                        path.display()
                    )));
                }
                Ok(Bytes::from(bytes))
            })
            .collect()
    }

    /// Writes the data files, then the record.
    pub fn store(&self, version: u64, buffers: &[Bytes]) -> NnrtResult<()> {
        if buffers.is_empty() || buffers.len() > MAX_CACHE_FILES {
            return Err(NnrtError::invalid_argument(format!(
                "a cache holds 1..={MAX_CACHE_FILES} buffers, got {}",
                buffers.len()
            )));
        }
        fs::create_dir_all(&self.dir).map_err(|err| {
            NnrtError::invalid_path(format!(
                "failed to create cache directory {}: {err}",
                self.dir.display()
            ))
        })?;

        for (index, buffer) in buffers.iter().enumerate() {
            let path = self.data_path(index);
            fs::write(&path, buffer).map_err(|err| {
                NnrtError::failed(format!("failed to write {}: {err}", path.display()))
            })?;
        }

        let data = RecordData {
            device_id: self.device_hash,
            file_number: buffers.len() as u64,
            version,
            model_checksum: buffers.iter().map(|b| checksum(b)).collect(),
        };
        let record = Record {
            checksum: record_checksum(&data)?,
            data,
        };
        let encoded = serde_json::to_vec(&record)
            .map_err(|err| NnrtError::failed(format!("failed to encode cache record: {err}")))?;
        self.write_record(&encoded)?;
        debug!(dir = %self.dir.display(), files = buffers.len(), version, "model cache stored");
        Ok(())
    }

    fn write_record(&self, encoded: &[u8]) -> NnrtResult<()> {
        let path = self.record_path();
        let fail = |err: std::io::Error| {
            NnrtError::failed(format!("failed to write {}: {err}", path.display()))
        };
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(fail)?;
        staged.write_all(encoded).map_err(fail)?;
        staged
            .persist(&path)
            .map_err(|err| fail(err.error))?;
        Ok(())
    }

    /// Deletes the record and passes `err` through.
    fn discard(&self, err: NnrtError) -> NnrtError {
        warn!(dir = %self.dir.display(), %err, "discarding model cache");
        match fs::remove_file(self.record_path()) {
            Ok(()) => {}
            Err(io) if io.kind() == IoErrorKind::NotFound => {}
            Err(io) => warn!(%io, "failed to delete cache record"),
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::checksum;

    #[test]
    fn checksum_folds_carries() {
        assert_eq!(checksum(&[]), 0xffff);
        assert_eq!(checksum(&[0x01, 0x00]), 0xfffe);
        // 0xffff + 0x0002 = 0x10001, folded to 0x0002.
        assert_eq!(checksum(&[0xff, 0xff, 0x02, 0x00]), 0xfffd);
        assert_eq!(checksum(&[0x05]), !0x0005);
    }
}
