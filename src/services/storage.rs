use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::services::rate_limiter::RateLimiter;

/// Reference photos kept in memory, per (batch, student).
const CACHE_CAPACITY: usize = 100;

/// Object key of a student's reference photo.
pub fn reference_key(batch: &str, student_id: &str) -> String {
    format!("students/{batch}/{student_id}.jpg")
}

/// Small FIFO cache so repeated attempts don't refetch the same photo.
struct ReferenceCache {
    entries: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
}

impl ReferenceCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, bytes: Vec<u8>) {
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= CACHE_CAPACITY {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, bytes);
    }
}

/// Reference-photo store on S3-compatible object storage.
pub struct ReferenceImageStore {
    bucket: Box<Bucket>,
    limiter: RateLimiter,
    cache: Mutex<ReferenceCache>,
}

impl ReferenceImageStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        limiter: RateLimiter,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            limiter,
            cache: Mutex::new(ReferenceCache::new()),
        })
    }

    /// Download the reference photo of `student_id` in `batch`.
    /// Returns `Ok(None)` when no photo exists at that key.
    pub async fn fetch_reference(
        &self,
        batch: &str,
        student_id: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let key = reference_key(batch, student_id);
        let cached = self.cache().get(&key);
        if let Some(hit) = cached {
            tracing::debug!(key = %key, "Reference photo cache hit");
            return Ok(Some(hit));
        }

        self.limiter.until_ready().await;
        let response = match self.bucket.get_object(&key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => return Ok(None),
            Err(e) => return Err(StorageError::S3(e)),
        };

        match response.status_code() {
            200 => {
                let bytes = response.to_vec();
                self.cache().insert(key, bytes.clone());
                Ok(Some(bytes))
            }
            404 => Ok(None),
            status => Err(StorageError::Status { key, status }),
        }
    }

    #[cfg(test)]
    pub(crate) fn preload(&self, batch: &str, student_id: &str, bytes: Vec<u8>) {
        self.cache().insert(reference_key(batch, student_id), bytes);
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ReferenceCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Unexpected status {status} fetching {key}")]
    Status { key: String, status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
