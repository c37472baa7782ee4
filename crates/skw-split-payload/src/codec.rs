use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    FailToEncode(String),
    #[error("failed to decode payload: {0}")]
    FailToDecode(String),
}

pub fn encode<M>(payload: &M) -> Result<Vec<u8>, PayloadError>
    where M: Serialize
{
    bincode::serialize(payload)
        .map_err(|e| PayloadError::FailToEncode(e.to_string()))
}

pub fn decode<M>(raw: &[u8]) -> Result<M, PayloadError>
    where M: DeserializeOwned
{
    bincode::deserialize(raw)
        .map_err(|e| PayloadError::FailToDecode(e.to_string()))
}
