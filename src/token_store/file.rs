// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{errors::TokenStoreError, token::TrackingToken, token_store::TokenStore};

/// Token store persisting to a JSON file.
///
/// The layout is one object per processor, mapping segment ids to their
/// serialized tokens (`null` for segments that have not progressed yet).
/// Claims are not persisted: the file offers no cross-process claim
/// atomicity, so this store is only suitable for a single process. Within
/// that process the processor's own bookkeeping keeps segments exclusive.
///
/// # Example
/// ```no_run
/// use event_tracking_core::{FileTokenStore, TokenStore};
///
/// #[tokio::main]
/// async fn main() {
///     let store = FileTokenStore::new("tokens.json").await.unwrap();
///     store.initialize_token_segments("projector", 2).await.unwrap();
///     assert_eq!(store.fetch_segments("projector").await.unwrap(), vec![0, 1]);
/// }
/// ```
pub struct FileTokenStore {
    /// The [`File`] handle used to interact with the token file.
    file: Mutex<File>,
}

impl FileTokenStore {
    /// Creates a new `FileTokenStore` by opening or creating the file at the
    /// specified path.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        Self::open_or_create_file(path.into())
            .await
            .map(|file| Self {
                file: Mutex::new(file),
            })
    }

    async fn open_or_create_file(path: PathBuf) -> Result<File, TokenStoreError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(io_error)
    }

    fn empty_json_object() -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Reads the file content and parses it as a JSON [`Value`]. An empty or
    /// corrupted file parses as an empty object, so a damaged store starts
    /// over from a clean state instead of wedging the processor.
    async fn read_file_to_json_value(&self, file: &mut File) -> Result<Value, TokenStoreError> {
        if file.metadata().await.map_err(io_error)?.len() == 0 {
            return Ok(Self::empty_json_object());
        }
        // before reading seek to the start of the file
        file.seek(SeekFrom::Start(0)).await.map_err(io_error)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(io_error)?;
        Ok(serde_json::from_slice::<Value>(buf.as_slice())
            .inspect_err(|err| tracing::warn!("corrupted or invalid JSON file: {err}"))
            .unwrap_or_else(|_| Self::empty_json_object()))
    }

    /// Writes the given data to the file, overwriting any existing content.
    async fn write_to_file(
        &self,
        file: &mut File,
        data: impl AsRef<[u8]>,
    ) -> Result<(), TokenStoreError> {
        file.seek(SeekFrom::Start(0)).await.map_err(io_error)?;
        file.set_len(0).await.map_err(io_error)?;
        file.write_all(data.as_ref()).await.map_err(io_error)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn fetch_segments(&self, processor_name: &str) -> Result<Vec<u32>, TokenStoreError> {
        let mut file = self.file.lock().await;
        let content = self.read_file_to_json_value(&mut file).await?;
        let mut segments: Vec<u32> = content
            .get(processor_name)
            .and_then(Value::as_object)
            .map(|rows| {
                rows.keys()
                    .filter_map(|segment_id| segment_id.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        segments.sort_unstable();
        Ok(segments)
    }

    async fn initialize_token_segments(
        &self,
        processor_name: &str,
        count: u32,
    ) -> Result<(), TokenStoreError> {
        let mut file = self.file.lock().await;
        let mut content = self.read_file_to_json_value(&mut file).await?;
        if content
            .get(processor_name)
            .and_then(Value::as_object)
            .is_some_and(|rows| !rows.is_empty())
        {
            return Err(TokenStoreError::Transient(format!(
                "segments for `{processor_name}` already initialized"
            )));
        }
        let rows: serde_json::Map<String, Value> = (0..count)
            .map(|segment_id| (segment_id.to_string(), Value::Null))
            .collect();
        content[processor_name] = Value::Object(rows);
        self.write_to_file(&mut file, serialize_content(&content)?)
            .await
    }

    async fn fetch_token(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<Option<TrackingToken>, TokenStoreError> {
        let mut file = self.file.lock().await;
        let content = self.read_file_to_json_value(&mut file).await?;
        let row = content
            .get(processor_name)
            .and_then(|rows| rows.get(segment_id.to_string()))
            .ok_or_else(|| TokenStoreError::UnableToClaim {
                segment: segment_id,
                reason: "segment is not initialized".into(),
            })?;
        if row.is_null() {
            return Ok(None);
        }
        serde_json::from_value(row.clone())
            .map(Some)
            .map_err(|err| TokenStoreError::Fatal(format!("stored token is corrupt: {err}")))
    }

    async fn store_token(
        &self,
        token: &TrackingToken,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        let serialized = serde_json::to_value(token)
            .map_err(|err| TokenStoreError::Fatal(format!("token is not serializable: {err}")))?;
        let mut file = self.file.lock().await;
        let mut content = self.read_file_to_json_value(&mut file).await?;
        if !content
            .get(processor_name)
            .is_some_and(Value::is_object)
        {
            content[processor_name] = Self::empty_json_object();
        }
        content[processor_name][segment_id.to_string()] = serialized;
        self.write_to_file(&mut file, serialize_content(&content)?)
            .await
    }

    async fn extend_claim(
        &self,
        _processor_name: &str,
        _segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        // Claims live and die with the process for this store.
        Ok(())
    }

    async fn release_claim(
        &self,
        _processor_name: &str,
        _segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        Ok(())
    }
}

fn serialize_content(content: &Value) -> Result<String, TokenStoreError> {
    serde_json::to_string_pretty(content)
        .map_err(|err| TokenStoreError::Fatal(format!("token file is not serializable: {err}")))
}

fn io_error(err: std::io::Error) -> TokenStoreError {
    TokenStoreError::Transient(err.to_string())
}
