//! S3 blob store.
//!
//! Works against AWS S3 and S3-compatible endpoints (MinIO, GCS XML
//! interoperability) via `endpoint`. Credentials come from the standard AWS
//! provider chain.

use super::BlobStore;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

/// Configuration for the S3 blob store.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,

    /// Custom endpoint URL for S3-compatible stores.
    pub endpoint: Option<String>,

    /// Region override (defaults to the provider chain).
    pub region: Option<String>,
}

/// Blob store writing objects with `PutObject`.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a client from the environment and the given config.
    pub async fn connect(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Config("S3 bucket name is empty".to_string()));
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        tracing::info!(
            "S3 blob store initialized: bucket={}, endpoint={}",
            config.bucket,
            config.endpoint.as_deref().unwrap_or("default")
        );

        Ok(Self::with_client(S3Client::from_conf(builder.build()), config.bucket))
    }

    /// Wrap an existing client.
    pub fn with_client(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                Error::S3(format!(
                    "put s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}
