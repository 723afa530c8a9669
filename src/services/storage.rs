use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::path::Path;

/// Named-object storage for original and annotated images.
///
/// `put` overwrites, so re-uploading the same key is always safe.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Download `key` into `local_path`, creating parent directories.
    /// A missing object is reported as [`StorageError::NotFound`].
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError>;
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub region: String,
    /// Custom endpoint (MinIO, R2, LocalStack). AWS when absent.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

/// Client for S3-compatible object storage.
pub struct S3BlobStore {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3BlobStore {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings
                .region
                .parse::<Region>()
                .map_err(|e| StorageError::Config(e.to_string()))?,
        };

        // With no explicit keys the credential chain (env, profile, instance
        // metadata) is used.
        let credentials = Credentials::new(
            settings.access_key.as_deref(),
            settings.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            path_style: settings.path_style,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(local_path).await?;
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(key, &data, content_type_for(&data))
            .await
            .map_err(StorageError::S3)?;

        match response.status_code() {
            200..=299 => Ok(()),
            status => Err(StorageError::Status {
                status,
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let not_found = || StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        let response = match self.bucket(bucket)?.get_object(key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => return Err(not_found()),
            Err(e) => return Err(StorageError::S3(e)),
        };

        match response.status_code() {
            200..=299 => {}
            404 => return Err(not_found()),
            status => {
                return Err(StorageError::Status {
                    status,
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, response.to_vec()).await?;
        Ok(())
    }
}

/// MIME type sniffed from the image header.
pub fn content_type_for(data: &[u8]) -> &'static str {
    image::guess_format(data)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("S3 returned status {status} for {bucket}/{key}")]
    Status {
        status: u16,
        bucket: String,
        key: String,
    },

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
