use bytes::Bytes;
use thiserror::Error;

use crate::model::AssignedTask;

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("Encode error: {0}")]
  Encode(serde_json::Error),
  #[error("Decode error: {0}")]
  Decode(serde_json::Error),
}

/// Binary codec for the task description shipped to workers inside a launch.
/// The payload is opaque to everything but the executor.
pub trait Codec: Send + Sync {
  fn encode(&self, task: &AssignedTask) -> Result<Bytes, CodecError>;
  fn decode(&self, data: &[u8]) -> Result<AssignedTask, CodecError>;
}

/// JSON rendition of the codec; the production deployment substitutes
/// whatever the executor speaks.
#[derive(Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
  fn encode(&self, task: &AssignedTask) -> Result<Bytes, CodecError> {
    let data = serde_json::to_vec(task).map_err(CodecError::Encode)?;
    return Ok(Bytes::from(data));
  }

  fn decode(&self, data: &[u8]) -> Result<AssignedTask, CodecError> {
    return serde_json::from_slice(data).map_err(CodecError::Decode);
  }
}
