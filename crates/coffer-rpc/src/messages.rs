//! Wire shapes of the storage RPC.
//!
//! One request/reply pair per storage method; binary buffers travel as
//! base64 strings inside the JSON bodies.

use coffer_common::StorageError;
use serde::{Deserialize, Serialize};

/// Base64 (de)serialization for byte buffers embedded in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginArgs {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginReply {
    pub token: String,
    pub server_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenericArgs {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenericReply {}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolArgs {
    pub token: String,
    pub volume: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDirArgs {
    pub token: String,
    pub volume: String,
    pub dir_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileArgs {
    pub token: String,
    pub volume: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadFileArgs {
    pub token: String,
    pub volume: String,
    pub path: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendFileArgs {
    pub token: String,
    pub volume: String,
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub buffer: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameFileArgs {
    pub token: String,
    pub src_volume: String,
    pub src_path: String,
    pub dst_volume: String,
    pub dst_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataReply {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
}

impl RpcErrorBody {
    #[must_use]
    pub fn from_storage(err: &StorageError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn to_storage(&self) -> StorageError {
        StorageError::from_code(&self.code, &self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_round_trip_as_base64() {
        let args = AppendFileArgs {
            token: "t".to_string(),
            volume: "vol".to_string(),
            path: "a/b".to_string(),
            buffer: vec![0, 1, 2, 255, 254],
        };
        let json = serde_json::to_string(&args).unwrap();
        assert!(json.contains("AAEC//4="));
        let back: AppendFileArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buffer, args.buffer);
    }

    #[test]
    fn error_body_round_trip() {
        let body = RpcErrorBody::from_storage(&StorageError::VolumeNotFound);
        assert_eq!(body.code, "VolumeNotFound");
        assert_eq!(body.to_storage(), StorageError::VolumeNotFound);
    }
}
