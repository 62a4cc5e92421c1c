// Object storage client.
//
// The teacher's `blob`/`uploader`/`syncdir` modules talk to Azure Blob
// Storage directly. The object store here is S3/MinIO-shaped, so this
// module replaces those with a `StorageClient` trait and one
// `S3StorageClient` implementation backed by `aws-sdk-s3`, keeping the same
// "parse a path, redact the secret query parameter when logging it" shape
// the teacher's `blob::url` module used for Azure SAS URLs.

use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use reqwest::Url;
use serde::{de, Serialize, Serializer};

/// A single object's address: `/{bucket}/{key}`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct StoragePath {
    bucket: String,
    key: String,
}

impl StoragePath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        let key = key.into();

        if bucket.is_empty() {
            bail!("storage path is missing a bucket: {}", key);
        }

        Ok(Self { bucket, key })
    }

    pub fn parse(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref().trim_start_matches('/');
        let mut parts = path.splitn(2, '/');

        let bucket = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format_err!("invalid storage path: {}", path))?;
        let key = parts.next().unwrap_or_default();

        Self::new(bucket, key)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// A new path for `name` alongside this one, in the same bucket.
    pub fn join(&self, name: impl AsRef<str>) -> Self {
        let key = if self.key.is_empty() {
            name.as_ref().to_owned()
        } else {
            format!("{}/{}", self.key, name.as_ref())
        };

        Self {
            bucket: self.bucket.clone(),
            key,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next()
    }
}

impl fmt::Debug for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}/{}", self.bucket, self.key)
    }
}

impl Serialize for StoragePath {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> de::Deserialize<'de> for StoragePath {
    fn deserialize<D>(de: D) -> std::result::Result<StoragePath, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = StoragePath;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a storage path of the form /{{bucket}}/{{key}}")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                StoragePath::parse(s).map_err(de::Error::custom)
            }
        }

        de.deserialize_any(Visitor)
    }
}

/// A presigned download/upload URL. `Debug` redacts the SigV4 signature
/// query parameter, mirroring the teacher's redaction of Azure `sig=`.
#[derive(Clone)]
pub struct PresignedUrl(Url);

impl PresignedUrl {
    pub fn new(url: Url) -> Self {
        Self(url)
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Debug for PresignedUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut redacted = self.0.clone();
        redacted.set_query(None);

        for (k, v) in self.0.query_pairs() {
            let is_secret = k == "X-Amz-Signature" || k == "X-Amz-Credential";
            let v = if is_secret { "REDACTED" } else { &v };
            redacted.query_pairs_mut().append_pair(&k, v);
        }

        write!(f, "{}", redacted)
    }
}

#[derive(Clone, Debug)]
pub struct BlobMetadata {
    pub path: StoragePath,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
}

/// Exactly the operations the task/supervisor code needs against the object
/// store, independent of which provider backs it.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<()>;
    async fn list_blobs(&self, prefix: &StoragePath) -> Result<Vec<BlobMetadata>>;
    async fn get(&self, path: &StoragePath) -> Result<BlobMetadata>;
    async fn read_data(&self, path: &StoragePath) -> Result<Vec<u8>>;
    async fn write_data(&self, path: &StoragePath, data: Vec<u8>) -> Result<()>;
    async fn copy_file_to(&self, local: &Path, path: &StoragePath) -> Result<()>;
    async fn copy_file_from(&self, path: &StoragePath, local: &Path) -> Result<()>;
    async fn delete(&self, path: &StoragePath) -> Result<()>;
    async fn last_updated(&self, path: &StoragePath) -> Result<Option<SystemTime>>;
}

/// `StorageClient` implementation against S3 or an S3-compatible store
/// (MinIO). `endpoint` overrides the default AWS endpoint resolution so the
/// same client code path works against either.
#[derive(Clone)]
pub struct S3StorageClient {
    client: S3Client,
}

impl S3StorageClient {
    pub async fn new(
        endpoint: Option<Url>,
        region: impl Into<String>,
        credentials: Option<(String, String)>,
    ) -> Result<Self> {
        let region = Region::new(region.into());
        let mut loader = aws_config::from_env().region(region);

        if let Some((key, secret)) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                key,
                secret,
                None,
                None,
                "pingu-bot",
            ));
        }

        let shared_config = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = endpoint {
            // MinIO and other S3-compatible stores need path-style addressing
            // and an explicit endpoint override.
            s3_config = s3_config
                .endpoint_url(endpoint.as_str())
                .force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config.build());

        Ok(Self { client })
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let svc_err = err.into_service_error();
                if svc_err.is_bucket_already_owned_by_you() || svc_err.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(svc_err).context("create_bucket")
                }
            }
        }
    }

    async fn list_blobs(&self, prefix: &StoragePath) -> Result<Vec<BlobMetadata>> {
        let mut results = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(prefix.bucket())
                .prefix(prefix.key());

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.context("list_blobs")?;

            for object in response.contents() {
                let key = match object.key() {
                    Some(key) => key,
                    None => continue,
                };

                results.push(BlobMetadata {
                    path: StoragePath::new(prefix.bucket(), key)?,
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| SystemTime::try_from(*t).ok()),
                });
            }

            if response.is_truncated().unwrap_or_default() {
                continuation_token = response.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }

        results.sort_by(|a, b| a.path.key().cmp(b.path.key()));
        Ok(results)
    }

    async fn get(&self, path: &StoragePath) -> Result<BlobMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(path.bucket())
            .key(path.key())
            .send()
            .await
            .with_context(|| format!("get metadata: {}", path))?;

        Ok(BlobMetadata {
            path: path.clone(),
            size: response.content_length().unwrap_or_default().max(0) as u64,
            last_modified: response
                .last_modified()
                .and_then(|t| SystemTime::try_from(*t).ok()),
        })
    }

    async fn read_data(&self, path: &StoragePath) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(path.bucket())
            .key(path.key())
            .send()
            .await
            .with_context(|| format!("read_data: {}", path))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("read_data body: {}", path))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn write_data(&self, path: &StoragePath, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(path.bucket())
            .key(path.key())
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("write_data: {}", path))?;

        Ok(())
    }

    async fn copy_file_to(&self, local: &Path, path: &StoragePath) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .with_context(|| format!("open for upload: {}", local.display()))?;

        self.client
            .put_object()
            .bucket(path.bucket())
            .key(path.key())
            .body(body)
            .send()
            .await
            .with_context(|| format!("copy_file_to: {} -> {}", local.display(), path))?;

        Ok(())
    }

    async fn copy_file_from(&self, path: &StoragePath, local: &Path) -> Result<()> {
        let data = self.read_data(path).await?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(local, data)
            .await
            .with_context(|| format!("copy_file_from: {} -> {}", path, local.display()))?;

        Ok(())
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.client
            .delete_object()
            .bucket(path.bucket())
            .key(path.key())
            .send()
            .await
            .with_context(|| format!("delete: {}", path))?;

        Ok(())
    }

    async fn last_updated(&self, path: &StoragePath) -> Result<Option<SystemTime>> {
        match self.get(path).await {
            Ok(metadata) => Ok(metadata.last_modified),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_parse() {
        let path = StoragePath::parse("/my-bucket/corpus/seed-1").unwrap();
        assert_eq!(path.bucket(), "my-bucket");
        assert_eq!(path.key(), "corpus/seed-1");
        assert_eq!(path.to_string(), "/my-bucket/corpus/seed-1");
    }

    #[test]
    fn test_storage_path_parse_bucket_only() {
        let path = StoragePath::parse("/my-bucket").unwrap();
        assert_eq!(path.bucket(), "my-bucket");
        assert_eq!(path.key(), "");
    }

    #[test]
    fn test_storage_path_parse_invalid() {
        assert!(StoragePath::parse("").is_err());
        assert!(StoragePath::parse("/").is_err());
    }

    #[test]
    fn test_storage_path_join() {
        let path = StoragePath::new("bucket", "corpus").unwrap();
        let joined = path.join("seed-1");
        assert_eq!(joined.to_string(), "/bucket/corpus/seed-1");
    }

    #[test]
    fn test_storage_path_file_name() {
        let path = StoragePath::new("bucket", "corpus/seed-1").unwrap();
        assert_eq!(path.file_name(), Some("seed-1"));
    }

    #[test]
    fn test_presigned_url_redacted() {
        let url = Url::parse(
            "https://minio.example/bucket/key?X-Amz-Signature=secret&X-Amz-Expires=3600",
        )
        .unwrap();
        let debug = format!("{:?}", PresignedUrl::new(url));
        assert!(debug.contains("X-Amz-Signature=REDACTED"));
        assert!(debug.contains("X-Amz-Expires=3600"));
    }
}
