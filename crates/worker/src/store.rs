//! Object storage and CDN clients.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chart_snap_common::{CdnConfig, Error, Result, StoreConfig, UploadResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Answers "is this artifact already published?".
#[async_trait]
pub trait ExistenceOracle: Send + Sync {
    /// Any failure to find out counts as absent.
    async fn exists(&self, url: &str) -> bool;
}

/// Durable storage for captured artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadResult>;

    /// Upload a JSON data file, stored as `application/json`.
    async fn upload_json(&self, local_path: &Path, key: &str) -> Result<UploadResult>;
}

/// Content type derived from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        key.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", prefix, key.trim_start_matches('/'))
    }
}

/// CDN existence check via `HEAD`. Only a 200 counts as present.
pub struct HttpExistenceOracle {
    client: reqwest::Client,
}

impl HttpExistenceOracle {
    pub fn new(config: &CdnConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.head_timeout)
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Like [`ExistenceOracle::exists`], but surfaces transport errors.
    pub async fn check(&self, url: &str) -> Result<bool> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| Error::ExistenceCheckFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }
}

#[async_trait]
impl ExistenceOracle for HttpExistenceOracle {
    async fn exists(&self, url: &str) -> bool {
        match self.check(url).await {
            Ok(present) => {
                debug!("HEAD {} -> {}", url, if present { "present" } else { "absent" });
                present
            }
            Err(e) => {
                debug!("{}, treating as absent", e);
                false
            }
        }
    }
}

/// S3 (or S3-compatible) artifact store.
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    region: String,
    key_prefix: String,
    endpoint: Option<String>,
    upload_timeout: Duration,
}

impl S3ArtifactStore {
    /// Build the client. Static keys from the config win over the default AWS chain.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        if config.bucket.is_empty() || config.region.is_empty() {
            return Err(Error::Config {
                message: "store.bucket and store.region are required".to_string(),
            });
        }

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            builder = builder.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "chart-snap",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            key_prefix: config.key_prefix.clone(),
            endpoint: config.endpoint.clone(),
            upload_timeout: config.upload_timeout(),
        })
    }

    fn object_url(&self, full_key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                full_key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, full_key
            ),
        }
    }

    async fn put_file(&self, local_path: &Path, key: &str, content_type: &str) -> Result<UploadResult> {
        let full_key = join_key(&self.key_prefix, key);
        let upload_failed = |message: String| Error::UploadFailed {
            key: full_key.clone(),
            message,
        };

        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| upload_failed(format!("cannot stat {}: {}", local_path.display(), e)))?
            .len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| upload_failed(format!("cannot read {}: {}", local_path.display(), e)))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(body)
            .send();

        match tokio::time::timeout(self.upload_timeout, request).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(upload_failed(e.to_string())),
            Err(_) => {
                return Err(upload_failed(format!(
                    "timed out after {:?}",
                    self.upload_timeout
                )))
            }
        }

        info!(
            s3_key = %full_key,
            size,
            content_type,
            "Uploaded {}",
            local_path.display()
        );

        Ok(UploadResult {
            url: self.object_url(&full_key),
            key: full_key,
            size,
            uploaded_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadResult> {
        self.put_file(local_path, key, content_type_for(local_path)).await
    }

    async fn upload_json(&self, local_path: &Path, key: &str) -> Result<UploadResult> {
        self.put_file(local_path, key, "application/json").await
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// In-memory store that also answers existence checks for what it holds.
///
/// Objects are published at `{public_base}/{key}`.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    public_base: String,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    published: Arc<RwLock<HashSet<String>>>,
    existence_checks: Arc<AtomicUsize>,
    uploads: Arc<AtomicUsize>,
    fail_uploads: Arc<AtomicBool>,
}

impl MemoryArtifactStore {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Mark a URL as present without uploading anything.
    pub fn publish(&self, url: impl Into<String>) {
        if let Ok(mut published) = self.published.write() {
            published.insert(url.into());
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn existence_checks(&self) -> usize {
        self.existence_checks.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    async fn store(&self, local_path: &Path, key: &str, content_type: &str) -> Result<UploadResult> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::UploadFailed {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let data = tokio::fs::read(local_path).await?;
        let size = data.len() as u64;
        let uploaded_at = Utc::now();
        let url = format!("{}/{}", self.public_base, key);

        self.objects.write().map_err(lock_poisoned(key))?.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                uploaded_at,
            },
        );
        self.published
            .write()
            .map_err(lock_poisoned(key))?
            .insert(url.clone());

        Ok(UploadResult {
            url,
            key: key.to_string(),
            size,
            uploaded_at,
        })
    }
}

fn lock_poisoned<T>(key: &str) -> impl FnOnce(PoisonError<T>) -> Error + '_ {
    move |_| Error::UploadFailed {
        key: key.to_string(),
        message: "lock poisoned".to_string(),
    }
}

#[async_trait]
impl ExistenceOracle for MemoryArtifactStore {
    async fn exists(&self, url: &str) -> bool {
        self.existence_checks.fetch_add(1, Ordering::SeqCst);
        self.published
            .read()
            .map(|published| published.contains(url))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadResult> {
        self.store(local_path, key, content_type_for(local_path)).await
    }

    async fn upload_json(&self, local_path: &Path, key: &str) -> Result<UploadResult> {
        self.store(local_path, key, "application/json").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type_for(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for(Path::new("a.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for(Path::new("a")), "application/octet-stream");
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "screenshots/a.png"), "screenshots/a.png");
        assert_eq!(join_key("charts/", "screenshots/a.png"), "charts/screenshots/a.png");
        assert_eq!(join_key("/charts", "/data/a.json"), "charts/data/a.json");
    }

    #[tokio::test]
    async fn test_memory_store_publishes_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("NVDA_us_1d_20250101.png");
        tokio::fs::write(&path, b"png-bytes").await.unwrap();

        let store = MemoryArtifactStore::new("https://cdn.example.com/");
        let url = "https://cdn.example.com/screenshots/NVDA_us_1d_20250101.png";
        assert!(!store.exists(url).await);

        let result = store
            .upload(&path, "screenshots/NVDA_us_1d_20250101.png")
            .await
            .unwrap();
        assert_eq!(result.url, url);
        assert_eq!(result.size, 9);
        assert!(store.exists(url).await);
        assert_eq!(
            store.object("screenshots/NVDA_us_1d_20250101.png").unwrap().content_type,
            "image/png"
        );
        assert_eq!(store.existence_checks(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_json_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        tokio::fs::write(&path, br#"{"close": 1.0}"#).await.unwrap();

        let store = MemoryArtifactStore::new("https://cdn.example.com");
        let result = store
            .upload_json(&path, "data/NVDA_us_1d_20250101.json")
            .await
            .unwrap();
        assert_eq!(result.key, "data/NVDA_us_1d_20250101.json");
        assert_eq!(
            store.object(&result.key).unwrap().content_type,
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        tokio::fs::write(&path, b"x").await.unwrap();

        let store = MemoryArtifactStore::new("https://cdn.example.com");
        store.set_fail_uploads(true);
        let result = store.upload(&path, "screenshots/a.png").await;
        assert!(matches!(result, Err(Error::UploadFailed { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_reports_poisoned_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        tokio::fs::write(&path, b"x").await.unwrap();

        let store = MemoryArtifactStore::new("https://cdn.example.com");
        let published = store.published.clone();
        let _ = std::thread::spawn(move || {
            let _guard = published.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        let result = store.upload(&path, "screenshots/a.png").await;
        assert!(matches!(
            result,
            Err(Error::UploadFailed { ref key, ref message })
                if key == "screenshots/a.png" && message == "lock poisoned"
        ));
        // The object map is a separate lock and still took the write.
        assert!(store.object("screenshots/a.png").is_some());
    }

    #[tokio::test]
    async fn test_http_oracle_treats_transport_errors_as_absent() {
        let oracle = HttpExistenceOracle::new(&CdnConfig {
            head_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        // Nothing listens on port 9 of the loopback interface.
        let url = "http://127.0.0.1:9/screenshots/a.png";
        assert!(matches!(
            oracle.check(url).await,
            Err(Error::ExistenceCheckFailed { .. })
        ));
        assert!(!oracle.exists(url).await);
    }
}
