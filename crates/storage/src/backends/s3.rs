//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// S3 requires every part except the last to be at least 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const CREDENTIALS_ERROR_MARKER: &str = "mirror-s3-lazy-credentials";

/// Resolves the AWS default credentials chain on the first signed request
/// rather than at construction.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let region = aws_config::Region::new(self.region.clone());
        let chain = self
            .chain
            .get_or_init(|| async move {
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(region)
                    .build()
                    .await
            })
            .await;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER) {
        return StorageError::Config(
            "S3 credentials unavailable. Configure access_key_id/secret_access_key or ambient AWS credentials."
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    matches!(
        err,
        aws_sdk_s3::error::SdkError::ServiceError(service_err)
            if service_err.raw().status().as_u16() == 404
    )
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` addressing, which
    /// MinIO and several S3-compatible services require.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "mirror-config"),
            ),
            (None, None) => {
                builder.credentials_provider(LazyDefaultCredentialsProvider::new(region.clone()))
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        // Bare host:port endpoints (e.g. "minio:9000") default to http.
        let endpoint = endpoint.map(|url| {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint: endpoint.unwrap_or_else(|| format!("s3.{region}.amazonaws.com")),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if is_not_found(&err) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let full_key = self.full_key(key);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: BytesMut::with_capacity(MIN_PART_SIZE),
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    /// Write and delete a marker object to confirm bucket access.
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
        let marker_key = self.full_key(".mirror-health-check");

        let check = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(map_s3_operation_error(e)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// Multipart upload that buffers writes into 5 MiB parts.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: BytesMut,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(self.part_number)
                .build(),
        );
        self.part_number += 1;
        Ok(())
    }

    async fn abort_multipart(&self) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= MIN_PART_SIZE {
            let part = self.buffer.split_to(MIN_PART_SIZE).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let tail = self.buffer.split().freeze();

        // Multipart uploads cannot be empty.
        if self.parts.is_empty() {
            if let Err(e) = self.abort_multipart().await {
                tracing::warn!(key = %self.key, error = %e, "Failed to abort empty multipart upload");
            }
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(tail.into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            return Ok(self.bytes_written);
        }

        if !tail.is_empty() {
            self.upload_part(tail).await?;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.abort_multipart().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "mirror-builds",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_full_key_applies_prefix() {
        let backend = make_backend(Some("builds/".to_string())).await;
        assert_eq!(backend.full_key("oneplus3/20.0/a.zip"), "builds/oneplus3/20.0/a.zip");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("a.zip"), "a.zip");
    }

    #[tokio::test]
    async fn test_s3_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            None,
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_s3_new_normalizes_endpoint() {
        let backend = S3Backend::new(
            "bucket",
            Some("minio:9000".to_string()),
            None,
            None,
            None,
            None,
            true,
        )
        .await
        .unwrap();
        assert_eq!(backend.endpoint, "http://minio:9000");
        assert_eq!(backend.bucket(), "bucket");

        let backend = S3Backend::new("bucket", None, Some("eu-west-1".into()), None, None, None, false)
            .await
            .unwrap();
        assert_eq!(backend.endpoint, "s3.eu-west-1.amazonaws.com");
    }
}
