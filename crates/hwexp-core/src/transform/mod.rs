//! Batch transforms applied to GPU metrics before rendering.

mod pod_mapper;

use crate::error::TransformError;
use crate::metric::{Batch, SystemInfo};

pub use pod_mapper::PodMapper;

/// Enriches or rewrites a batch in place.
///
/// A failing transform aborts the whole cycle.
pub trait Transform: Send {
    fn process(&mut self, batch: &mut Batch, system_info: &SystemInfo) -> Result<(), TransformError>;

    fn name(&self) -> &str;
}
