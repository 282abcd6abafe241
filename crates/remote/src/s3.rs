//! S3-compatible implementation of [`RemoteStore`].

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::{CompletedPart, FetchedObject, ObjectMeta, RemoteStore};

/// Connection settings for [`S3Remote`].
#[derive(Clone)]
pub struct S3Config {
    /// Service URL. A bare `host:port` is taken as plain HTTP.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

pub struct S3Remote {
    client: Client,
}

impl S3Remote {
    /// Builds a client with static credentials and path-style addressing.
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "cachefs-config",
        );
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);

        if let Some(endpoint) = &config.endpoint {
            let lower = endpoint.to_ascii_lowercase();
            let endpoint = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("http://{endpoint}")
            };
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> RemoteError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err {
        let code = service_err.raw().status().as_u16();
        if code == 404 {
            return RemoteError::NotFound(key.to_string());
        }
        return RemoteError::Status {
            code,
            message: DisplayErrorContext(&err).to_string(),
        };
    }
    RemoteError::Request(DisplayErrorContext(&err).to_string())
}

fn part_number(part: u32) -> RemoteResult<i32> {
    i32::try_from(part).map_err(|_| RemoteError::Protocol(format!("part number {part}")))
}

#[async_trait]
impl RemoteStore for S3Remote {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> RemoteResult<FetchedObject> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let meta = output.metadata().and_then(ObjectMeta::from_map);
        let mut body = output.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await?;
        let size = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(bucket, key, size, "object fetched");
        Ok(FetchedObject { size, meta })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String> {
        let size = body.len();
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_md5(content_md5)
            .set_metadata(Some(meta.to_map()))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        debug!(bucket, key, size, "object stored");
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_metadata(Some(meta.to_map()))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Protocol("multipart upload without an upload id".into()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part: u32,
        body: Bytes,
        content_md5: &str,
    ) -> RemoteResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number(part)?)
            .content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Protocol(format!("part {part} without an ETag")))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()> {
        let mut manifest = Vec::with_capacity(parts.len());
        for part in parts {
            manifest.push(
                S3CompletedPart::builder()
                    .part_number(part_number(part.part_number)?)
                    .e_tag(&part.etag)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(manifest))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        debug!(bucket, key, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RemoteResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        debug!(bucket, key, upload_id, "multipart upload aborted");
        Ok(())
    }
}
