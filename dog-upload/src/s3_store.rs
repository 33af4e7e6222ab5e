use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::env;
use tracing::{debug, warn};

use crate::{ChunkStream, Destination, ObjectId, RemoteObjectStore, UploadError, UploadResult};

/// S3's lower bound for every multipart part except the last
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3-compatible store configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    /// Key prefix every folder is created under
    pub root_prefix: Option<String>,
    /// Size of each multipart part buffered while streaming
    pub part_size: usize,
}

impl S3Config {
    /// Read `S3_*` environment variables
    pub fn from_env() -> UploadResult<Self> {
        fn get_env(key: &str) -> UploadResult<String> {
            env::var(key).map_err(|_| UploadError::invalid(format!("{} environment variable required", key)))
        }

        let part_size = env::var("S3_PART_SIZE_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(16 * 1024 * 1024);

        Ok(Self {
            bucket: get_env("S3_BUCKET")?,
            region: get_env("S3_REGION")?,
            access_key_id: get_env("S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("S3_SECRET_ACCESS_KEY")?,
            endpoint_url: env::var("S3_ENDPOINT_URL").ok().filter(|v| !v.is_empty()),
            root_prefix: env::var("S3_ROOT_PREFIX").ok().filter(|v| !v.is_empty()),
            part_size: part_size.max(MIN_PART_SIZE),
        })
    }
}

/// Remote object store backed by an S3-compatible bucket.
///
/// Folders are key prefixes marked with a zero-byte `<prefix>/` object.
/// Objects are written with a multipart upload fed straight from the chunk
/// stream, so memory use is bounded by one part regardless of file size.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    root_prefix: Option<String>,
    part_size: usize,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "dog-upload",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                // Required by most self-hosted S3-compatible servers
                .force_path_style(config.endpoint_url.is_some())
                .build(),
        );

        Self {
            client,
            bucket: config.bucket,
            root_prefix: config.root_prefix,
            part_size: config.part_size.max(MIN_PART_SIZE),
        }
    }

    pub async fn from_env() -> UploadResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    fn map_aws_error(err: impl std::error::Error + Send + Sync + 'static) -> UploadError {
        UploadError::remote(aws_sdk_s3::error::DisplayErrorContext(err))
    }

    fn object_key(destination: &Destination, name: &str) -> String {
        let prefix = destination.as_str().trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Fill `buffer` from `body` until it holds at least `target` bytes or the stream ends
    async fn fill(body: &mut ChunkStream, buffer: &mut BytesMut, target: usize) -> UploadResult<bool> {
        while buffer.len() < target {
            match body.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn put_single(&self, key: &str, mime_type: &str, data: Bytes) -> UploadResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(mime_type)
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut body: ChunkStream,
        mut buffer: BytesMut,
    ) -> UploadResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;

        loop {
            let more = Self::fill(&mut body, &mut buffer, self.part_size).await?;
            let take = buffer.len().min(self.part_size);
            if take == 0 {
                break;
            }
            let part = buffer.split_to(take).freeze();

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(AwsByteStream::from(part))
                .send()
                .await
                .map_err(Self::map_aws_error)?;

            debug!(key, part_number, "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            if !more && buffer.is_empty() {
                break;
            }
        }

        Ok(parts)
    }
}

#[async_trait]
impl RemoteObjectStore for S3ObjectStore {
    async fn create_object(
        &self,
        destination: &Destination,
        name: &str,
        mime_type: &str,
        mut body: ChunkStream,
    ) -> UploadResult<ObjectId> {
        let key = Self::object_key(destination, name);

        // Small files never need a multipart upload
        let mut buffer = BytesMut::new();
        let more = Self::fill(&mut body, &mut buffer, self.part_size + 1).await?;
        if !more {
            self.put_single(&key, mime_type, buffer.freeze()).await?;
            return Ok(ObjectId::new(key));
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(mime_type)
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| UploadError::remote("S3 returned no multipart upload id"))?
            .to_string();

        let result = match self.upload_parts(&key, &upload_id, body, buffer).await {
            Ok(parts) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                .send()
                .await
                .map(|_| ())
                .map_err(Self::map_aws_error),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let abort = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(abort_err) = abort {
                warn!(key = %key, error = %Self::map_aws_error(abort_err), "Failed to abort multipart upload");
            }
            return Err(e);
        }

        Ok(ObjectId::new(key))
    }

    async fn resolve_or_create_folder(
        &self,
        name: &str,
        parent: Option<&Destination>,
    ) -> UploadResult<Destination> {
        let parent = parent
            .cloned()
            .or_else(|| self.root_prefix.clone().map(Destination::new))
            .unwrap_or_default();
        let prefix = format!("{}/", Self::object_key(&parent, name));

        let existing = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        if existing.contents().is_empty() {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&prefix)
                .body(AwsByteStream::from(Vec::new()))
                .send()
                .await
                .map_err(Self::map_aws_error)?;
        }

        Ok(Destination::new(prefix.trim_end_matches('/').to_string()))
    }
}
