//! Named side-channel values a client hands over with a graph.

use std::path::PathBuf;

use nnrt_core::{InputDimOverride, NnrtError, NnrtResult};
use nnrt_proto::hdi::v2::parse_input_dims;
use tracing::warn;

pub const EXT_CACHE_PATH: &str = "CachePath";
pub const EXT_MODEL_NAME: &str = "ModelName";
pub const EXT_PROFILING: &str = "Profiling";
pub const EXT_SHARE_FEATURE_MAP: &str = "isShareFeatureMap";
pub const EXT_INPUT_DIMS: &str = "InputDims";

/// Recognized extensions; absent keys stay `None` / empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extensions {
    pub cache_path: Option<PathBuf>,
    pub model_name: Option<String>,
    pub profiling: Option<bool>,
    pub shared_feature_map: Option<bool>,
    pub input_dims: Vec<InputDimOverride>,
}

fn utf8<'a>(name: &str, value: &'a [u8]) -> NnrtResult<&'a str> {
    std::str::from_utf8(value)
        .map_err(|_| NnrtError::invalid_argument(format!("extension {name} is not UTF-8")))
}

fn boolean(name: &str, value: &[u8]) -> NnrtResult<bool> {
    match value {
        b"true" | b"1" => Ok(true),
        b"false" | b"0" => Ok(false),
        other => Err(NnrtError::invalid_argument(format!(
            "extension {name} expects true/false, got {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

impl Extensions {
    pub fn parse<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> NnrtResult<Self> {
        let mut parsed = Extensions::default();
        for (name, value) in pairs {
            match name {
                EXT_CACHE_PATH => {
                    let path = utf8(name, value)?;
                    if path.is_empty() {
                        return Err(NnrtError::invalid_argument("extension CachePath is empty"));
                    }
                    parsed.cache_path = Some(PathBuf::from(path));
                }
                EXT_MODEL_NAME => parsed.model_name = Some(utf8(name, value)?.to_string()),
                EXT_PROFILING => parsed.profiling = Some(boolean(name, value)?),
                EXT_SHARE_FEATURE_MAP => parsed.shared_feature_map = Some(boolean(name, value)?),
                EXT_INPUT_DIMS => {
                    let entries = parse_input_dims(utf8(name, value)?).map_err(|err| {
                        NnrtError::invalid_argument(format!("extension InputDims: {err}"))
                    })?;
                    parsed.input_dims = entries
                        .into_iter()
                        .map(|(input, dims)| InputDimOverride {
                            input,
                            dims: dims
                                .into_iter()
                                .map(|d| usize::try_from(d).ok())
                                .collect(),
                        })
                        .collect();
                }
                other => warn!(name = other, "ignoring unknown extension"),
            }
        }
        Ok(parsed)
    }
}
