use std::sync::Arc;

use bytes::Bytes;
use nnrt_core::{AllocationTracker, SharedBuffer};
use nnrt_proto::hdi::{v1, v2, HdiRunOutput, HdiTensor, HdiTensorMut};
use nnrt_proto::WireModel;
use tracing::warn;

use crate::kernels::{self, RunError};
use crate::Settings;

/// A validated wire model plus a private copy of its constants.
pub struct RefPreparedModel {
    model: WireModel,
    constants: Bytes,
    settings: Settings,
    max_dynamic_dim: u32,
    tracker: Arc<AllocationTracker>,
}

impl RefPreparedModel {
    pub(crate) fn new(
        model: WireModel,
        constants: Bytes,
        settings: Settings,
        max_dynamic_dim: u32,
        tracker: Arc<AllocationTracker>,
    ) -> Self {
        Self {
            model,
            constants,
            settings,
            max_dynamic_dim,
            tracker,
        }
    }

    pub fn model(&self) -> &WireModel {
        &self.model
    }

    /// Encoded model first, then the constant blob when there is one.
    fn export(&self) -> Result<Vec<SharedBuffer>, ()> {
        let mut parts = vec![self.model.encode()];
        if !self.constants.is_empty() {
            parts.push(self.constants.clone());
        }
        parts
            .iter()
            .map(|part| {
                let mut buffer = SharedBuffer::allocate_tracked(part.len(), Arc::clone(&self.tracker))
                    .map_err(|err| warn!(%err, "cache export allocation failed"))?;
                buffer.as_mut_slice().copy_from_slice(part);
                Ok(buffer)
            })
            .collect()
    }

    /// Inclusive `(min, max)` per input dimension.
    fn dim_ranges(&self) -> Vec<Vec<(u32, u32)>> {
        self.model
            .inputs
            .iter()
            .enumerate()
            .map(|(input, index)| {
                let pinned = self
                    .settings
                    .input_dims
                    .iter()
                    .find(|(i, _)| *i == input)
                    .map(|(_, dims)| dims.as_slice());
                self.model.tensors[*index as usize]
                    .dims
                    .iter()
                    .enumerate()
                    .map(|(axis, dim)| {
                        let pinned = pinned.and_then(|dims| dims.get(axis)).copied();
                        match (*dim, pinned) {
                            (d, _) if d >= 0 => (d as u32, d as u32),
                            (_, Some(p)) if p > 0 => (p as u32, p as u32),
                            _ => (1, self.max_dynamic_dim),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn check_ranges(&self, inputs: &[HdiTensor<'_>]) -> bool {
        self.dim_ranges().iter().zip(inputs).all(|(ranges, input)| {
            ranges.len() == input.dims.len()
                && ranges
                    .iter()
                    .zip(&input.dims)
                    .all(|((min, max), d)| *d >= *min as i32 && *d as i64 <= *max as i64)
        })
    }

    fn execute(
        &self,
        inputs: &[HdiTensor<'_>],
        outputs: &mut [HdiTensorMut<'_>],
    ) -> Result<Vec<HdiRunOutput>, RunError> {
        let result = kernels::execute(
            &self.model,
            &self.constants,
            inputs,
            outputs,
            self.settings.profiling,
        );
        if let Err(err) = &result {
            warn!(%err, "reference run failed");
        }
        result
    }
}

impl v1::PreparedModel for RefPreparedModel {
    fn export_model_cache(&self) -> v1::HdiResult<Vec<SharedBuffer>> {
        self.export().map_err(|()| v1::HDF_ERR_MALLOC_FAIL)
    }

    fn run(
        &self,
        inputs: &[HdiTensor<'_>],
        outputs: &mut [HdiTensorMut<'_>],
    ) -> v1::HdiResult<Vec<HdiRunOutput>> {
        self.execute(inputs, outputs).map_err(|err| match err {
            RunError::InvalidInput(_) => v1::HDF_ERR_INVALID_PARAM,
            RunError::Internal(_) => v1::HDF_FAILURE,
        })
    }
}

impl v2::PreparedModel for RefPreparedModel {
    fn export_model_cache(&self) -> v2::HdiResult<Vec<SharedBuffer>> {
        self.export().map_err(|()| v2::NnrtStatus::OutOfMemory)
    }

    fn input_dim_ranges(&self) -> v2::HdiResult<(Vec<Vec<u32>>, Vec<Vec<u32>>)> {
        let ranges = self.dim_ranges();
        let mins = ranges
            .iter()
            .map(|input| input.iter().map(|(min, _)| *min).collect())
            .collect();
        let maxs = ranges
            .iter()
            .map(|input| input.iter().map(|(_, max)| *max).collect())
            .collect();
        Ok((mins, maxs))
    }

    fn run(
        &self,
        inputs: &[HdiTensor<'_>],
        outputs: &mut [HdiTensorMut<'_>],
    ) -> v2::HdiResult<Vec<HdiRunOutput>> {
        if !self.check_ranges(inputs) {
            return Err(v2::NnrtStatus::OutOfDimensionRanges);
        }
        self.execute(inputs, outputs).map_err(|err| match err {
            RunError::InvalidInput(_) => v2::NnrtStatus::InvalidShape,
            RunError::Internal(_) => v2::NnrtStatus::Failed,
        })
    }
}
