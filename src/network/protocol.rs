use crate::utils::format_mode;
use crate::{FileshareError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// How the receiver interprets the rest of a connection. Encoded as a bare
/// integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestType {
    SendString = 0,
    SendFile = 1,
}

impl TryFrom<u8> for RequestType {
    type Error = FileshareError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RequestType::SendString),
            1 => Ok(RequestType::SendFile),
            other => Err(FileshareError::Protocol(format!(
                "unrecognized request type {}",
                other
            ))),
        }
    }
}

impl From<RequestType> for u8 {
    fn from(value: RequestType) -> Self {
        value as u8
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::SendString => write!(f, "SendString"),
            RequestType::SendFile => write!(f, "SendFile"),
        }
    }
}

/// First frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub request_type: RequestType,
    pub transfer_id: Uuid,
}

impl RequestHeader {
    pub fn send_string() -> Self {
        Self {
            request_type: RequestType::SendString,
            transfer_id: Uuid::new_v4(),
        }
    }

    pub fn send_file(transfer_id: Uuid) -> Self {
        Self {
            request_type: RequestType::SendFile,
            transfer_id,
        }
    }
}

/// Second frame of a `SendFile` connection. `size` is the length of this
/// part, not of the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetadata {
    pub name: String,
    pub size: u64,
    pub mode: String,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    pub part_name: String,
    #[serde(default)]
    pub part_index: Option<u32>,
    #[serde(default)]
    pub part_count: Option<u32>,
}

impl PartMetadata {
    /// Metadata for the whole file; call [`PartMetadata::for_part`] to
    /// narrow it to one range.
    pub fn from_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .ok_or_else(|| FileshareError::FileOperation(format!("Invalid file name: {:?}", path)))?
            .to_string_lossy()
            .to_string();

        let mod_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Self {
            part_name: name.clone(),
            name,
            size: metadata.len(),
            mode: format_mode(&metadata),
            mod_time,
            is_dir: metadata.is_dir(),
            part_index: None,
            part_count: None,
        })
    }

    pub fn for_part(&self, part_index: u32, part_count: u32, size: u64) -> Self {
        Self {
            size,
            part_name: format!("{}{}", self.name, part_index),
            part_index: Some(part_index),
            part_count: Some(part_count),
            ..self.clone()
        }
    }

    /// Index of this part. Peers that omit `part_index` encode it as the
    /// digits appended to `name` in `part_name`.
    pub fn resolve_part_index(&self) -> Result<u32> {
        if let Some(index) = self.part_index {
            return Ok(index);
        }

        self.part_name
            .strip_prefix(self.name.as_str())
            .and_then(|suffix| suffix.parse::<u32>().ok())
            .ok_or_else(|| {
                FileshareError::Protocol(format!(
                    "cannot derive part index from part_name {:?}",
                    self.part_name
                ))
            })
    }

    pub fn resolve_part_count(&self, fallback: u32) -> u32 {
        self.part_count.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_wire_shape() {
        let id = Uuid::new_v4();
        let header = RequestHeader::send_file(id);
        let json = serde_json::to_value(&header).unwrap();

        assert_eq!(json["request_type"], 1);
        assert_eq!(json["transfer_id"], id.to_string());
    }

    #[test]
    fn test_unknown_request_type_rejected() {
        let raw = format!(
            r#"{{"request_type":7,"transfer_id":"{}"}}"#,
            Uuid::new_v4()
        );
        let result = serde_json::from_str::<RequestHeader>(&raw);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("request type 7"));
    }

    #[test]
    fn test_part_index_falls_back_to_part_name() {
        let raw = r#"{
            "name": "movie.mkv",
            "size": 10,
            "mode": "-rw-r--r--",
            "mod_time": "2024-05-01T10:00:00Z",
            "is_dir": false,
            "part_name": "movie.mkv3"
        }"#;
        let metadata: PartMetadata = serde_json::from_str(raw).unwrap();

        assert_eq!(metadata.part_index, None);
        assert_eq!(metadata.resolve_part_index().unwrap(), 3);
        assert_eq!(metadata.resolve_part_count(4), 4);
    }

    #[test]
    fn test_for_part_derives_part_name() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"0123456789").unwrap();

        let whole = PartMetadata::from_file(file.path()).unwrap();
        assert_eq!(whole.size, 10);
        assert!(!whole.is_dir);

        let part = whole.for_part(2, 4, 3);
        assert_eq!(part.size, 3);
        assert_eq!(part.part_name, format!("{}2", whole.name));
        assert_eq!(part.resolve_part_index().unwrap(), 2);
        assert_eq!(part.resolve_part_count(1), 4);
    }
}
