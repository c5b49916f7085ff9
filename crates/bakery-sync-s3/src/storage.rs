use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::Client as S3Client;
use bakery_sync_core::{
    temp_path_for, ObjectMeta, ObjectStore, StorageError, VersionedObject, WriteOutcome,
    WritePrecondition,
};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Parse an R2/S3 URI into bucket and key.
///
/// Supports formats:
/// - r2://bucket/key
/// - s3://bucket/key
pub fn parse_uri(uri: &str) -> Option<(String, String)> {
    let uri = uri
        .strip_prefix("r2://")
        .or_else(|| uri.strip_prefix("s3://"))?;

    let mut parts = uri.splitn(2, '/');
    let bucket = parts.next().filter(|b| !b.is_empty())?.to_string();
    let key = parts.next().unwrap_or("").trim_start_matches('/').to_string();
    Some((bucket, key))
}

/// Object store backed by one S3-compatible bucket.
///
/// Versions are ETags. Conditional writes use `If-None-Match: *` and
/// `If-Match: <etag>`; a 412 or 409 answer means the precondition failed.
/// Modification times come from `Last-Modified`, which has one-second
/// resolution.
#[derive(Clone)]
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the standard AWS environment (profile, env vars,
    /// instance metadata). `endpoint` targets R2, MinIO or other
    /// S3-compatible services and switches to path-style addressing.
    pub async fn from_env(bucket: impl Into<String>, endpoint: Option<String>) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(S3Client::from_conf(builder.build()), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// Map an SDK error: connectivity and credential failures make the store
/// unavailable, everything else is an I/O error.
fn map_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let unavailable = matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    ) || matches!(http_status(&err), Some(401) | Some(403));

    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    if unavailable {
        StorageError::Unavailable(message)
    } else {
        StorageError::Io(message)
    }
}

fn to_chrono(ts: Option<&S3DateTime>) -> DateTime<Utc> {
    ts.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStore for S3Store {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .get_versioned_inner(key)
            .await?
            .map(|(data, _)| data))
    }

    #[instrument(skip(self, data), level = "debug", fields(bucket = %self.bucket, data_len = data.len()))]
    async fn set(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error("S3 put_object", e))?;
        debug!("Put {} ({} bytes)", key, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectMeta {
                modified_at: to_chrono(output.last_modified.as_ref()),
                size_bytes: output.content_length.unwrap_or(0).max(0) as u64,
                version: output.e_tag,
            })),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false)
                    || http_status(&e) == Some(404);
                if not_found {
                    Ok(None)
                } else {
                    Err(map_sdk_error("S3 head_object", e))
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                return Err(if missing {
                    StorageError::NotFound(key.to_string())
                } else {
                    map_sdk_error("S3 get_object", e)
                });
            }
        };

        // Stream into a temp file, then swap it in.
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::io(format!("Failed to create dir {}", parent.display()), e)
            })?;
        }
        let temp = temp_path_for(local_path);
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StorageError::io(format!("Failed to create {}", temp.display()), e))?;
        let mut body = output.body.into_async_read();
        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| StorageError::io(format!("Failed to download {}", key), e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io(format!("Failed to flush {}", temp.display()), e))?;
        drop(file);
        tokio::fs::rename(&temp, local_path).await.map_err(|e| {
            StorageError::io(format!("Failed to replace {}", local_path.display()), e)
        })?;

        debug!("Downloaded {} to {} ({} bytes)", key, local_path.display(), bytes);
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            StorageError::Io(format!("Failed to open {}: {}", local_path.display(), e))
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error("S3 put_object", e))?;
        debug!("Uploaded {} to {}", local_path.display(), key);
        Ok(())
    }

    fn supports_conditional_writes(&self) -> bool {
        true
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedObject>, StorageError> {
        match self.get_versioned_inner(key).await? {
            None => Ok(None),
            Some((data, Some(version))) => Ok(Some(VersionedObject { data, version })),
            Some((_, None)) => Err(StorageError::Io(format!(
                "S3 get_object returned no ETag for {}",
                key
            ))),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(bucket = %self.bucket, data_len = data.len()))]
    async fn put_conditional(
        &self,
        key: &str,
        data: &[u8],
        precondition: &WritePrecondition,
    ) -> Result<WriteOutcome, StorageError> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()));
        let request = match precondition {
            WritePrecondition::DoesNotExist => request.if_none_match("*"),
            WritePrecondition::MatchesVersion(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) if matches!(http_status(&e), Some(412) | Some(409)) => {
                debug!("Precondition {:?} failed for {}", precondition, key);
                Ok(WriteOutcome::PreconditionFailed)
            }
            Err(e) => Err(map_sdk_error("S3 conditional put_object", e)),
        }
    }
}

impl S3Store {
    /// Read an object and its ETag.
    async fn get_versioned_inner(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<String>)>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag.clone();
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(format!("Failed to read S3 object body: {}", e)))?
                    .into_bytes();
                Ok(Some((bytes.to_vec(), etag)))
            }
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    Ok(None)
                } else {
                    Err(map_sdk_error("S3 get_object", e))
                }
            }
        }
    }
}
