use anyhow::Result;
use serde_json::Value;

/// Turns externalized property values into bytes and back.
pub trait DataBusSerializer: Send + Sync + 'static {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataBusSerializer;

impl DataBusSerializer for JsonDataBusSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
