use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::S3Config;
use crate::retry::TransientError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("network: {0}")]
    Network(String),
    #[error("other: {0}")]
    Other(String),
}

impl TransientError for StorageError {
    fn code(&self) -> Option<&str> { None }
    fn message(&self) -> String { self.to_string() }
    fn timed_out(after: Duration) -> Self {
        StorageError::Network(format!("timeout after {}ms", after.as_millis()))
    }
}

/// Object storage holding evidence files.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Stores `bytes` under `key`; storing an existing key is a no-op.
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), StorageError>;
    /// Retrievable URL for `key`, public or signed depending on configuration.
    async fn url(&self, key: &str) -> Result<String, StorageError>;
}

fn map_sdk<E: std::fmt::Debug, R: std::fmt::Debug>(e: SdkError<E, R>) -> StorageError {
    match &e {
        SdkError::TimeoutError(_) => StorageError::Network(format!("timeout: {e:?}")),
        SdkError::DispatchFailure(_) => StorageError::Network(format!("network dispatch failure: {e:?}")),
        _ => StorageError::Other(format!("{e:?}")),
    }
}

// ---------------- S3 Implementation (MinIO compatible) ----------------
pub struct S3EvidenceStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    public_base_url: Option<String>,
    url_ttl: Duration,
}

impl S3EvidenceStore {
    pub async fn new(cfg: &S3Config) -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let endpoint = cfg
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.region.clone()));
        loader = loader.endpoint_url(endpoint);
        if !cfg.access_key.is_empty() && !cfg.secret_key.is_empty() {
            let creds = Credentials::new(cfg.access_key.clone(), cfg.secret_key.clone(), None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // path-style addressing: MinIO/local endpoints have no wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized S3/MinIO client for evidence bucket '{}'", cfg.bucket);

        let bucket = cfg.bucket.clone();
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) if attempt >= max_attempts => {
                        error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                        return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                    }
                    Err(e2) => {
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(Duration::from_millis(backoff_ms as u64)).await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            public_base_url: cfg.public_base_url.clone(),
            url_ttl: cfg.url_ttl,
        })
    }
}

#[async_trait]
impl EvidenceStore for S3EvidenceStore {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), StorageError> {
        use aws_sdk_s3::primitives::ByteStream;
        // content-addressed keys: an existing object already holds these bytes
        if self.client.head_object().bucket(&self.bucket).key(key).send().await.is_ok() {
            return Ok(());
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type);
        if let Err(e) = put.send().await {
            error!("put_object failed key={key} bucket={} err={:?}", self.bucket, e);
            return Err(map_sdk(e));
        }
        Ok(())
    }

    async fn url(&self, key: &str) -> Result<String, StorageError> {
        if let Some(base) = &self.public_base_url {
            return Ok(format!("{}/{}/{}", base.trim_end_matches('/'), self.bucket, key));
        }
        use aws_sdk_s3::presigning::PresigningConfig;
        let presign = PresigningConfig::expires_in(self.url_ttl).map_err(|e| StorageError::Other(e.to_string()))?;
        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign)
            .await
            .map_err(map_sdk)?;
        Ok(req.uri().to_string())
    }
}

pub async fn build_evidence_store(cfg: &S3Config) -> anyhow::Result<Arc<dyn EvidenceStore>> {
    let store = S3EvidenceStore::new(cfg).await?;
    Ok(Arc::new(store))
}
