//! Blob storage contract for attachments and group photos.
//!
//! The chat core only ever sees stable URLs; resolving bytes to a URL
//! happens here, before a message or photo reference is written.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

/// Uploads raw bytes and returns a stable reference.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String>;
}

/// In-memory blob store for tests and local development.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob state poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String> {
        let mut blobs = self.blobs.lock().expect("blob state poisoned");
        blobs.insert(path.to_string(), bytes.to_vec());
        Ok(format!("memory://{path}"))
    }
}
