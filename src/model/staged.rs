use serde::{Deserialize, Serialize};

/// Object data together with its content identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Hex SHA-256 of `data`
    pub identity: String,
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
}

impl Value {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            identity: identity_of(&data),
            data,
        }
    }
}

pub fn identity_of(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// One key of a staging area. A tombstone records a staged delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    pub key: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default, with = "hex_data")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub tombstone: bool,
}

impl StagedEntry {
    pub fn write(key: String, value: Value) -> Self {
        Self {
            key,
            identity: value.identity,
            data: value.data,
            tombstone: false,
        }
    }

    pub fn tombstone(key: String) -> Self {
        Self {
            key,
            identity: String::new(),
            data: Vec::new(),
            tombstone: true,
        }
    }

    /// The staged value, or None for a staged delete
    pub fn value(&self) -> Option<Value> {
        if self.tombstone {
            None
        } else {
            Some(Value {
                identity: self.identity.clone(),
                data: self.data.clone(),
            })
        }
    }
}

mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
