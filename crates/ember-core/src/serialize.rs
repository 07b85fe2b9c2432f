use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::op::TensorId;
use crate::registry::Context;
use crate::shape::Shape;

/// Flat `{ id, shape, data }` record exchanged with storage and transport
/// layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub id: u64,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }
}

impl Context {
    /// Capture a tensor's shape and values, reading back from the device when
    /// needed.
    pub fn serialize(&self, id: TensorId) -> Result<TensorRecord> {
        let shape = self.get(id)?.dims().to_vec();
        let data = self.data(id)?;
        Ok(TensorRecord {
            id: id.raw(),
            shape,
            data,
        })
    }

    /// Register a host tensor rebuilt from a record. The record's id is not
    /// reused; the tensor gets a fresh one.
    pub fn deserialize(&mut self, record: &TensorRecord) -> Result<TensorId> {
        let shape = Shape::from(record.shape.as_slice());
        let id = self.create(shape, Some(&record.data), false, false)?;
        debug!(record = record.id, tensor = %id, "deserialize");
        Ok(id)
    }
}
