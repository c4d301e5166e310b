//! S3-compatible object store (AWS S3, MinIO)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

use super::{validate_key, ObjectStore, PutReceipt, StorageConfig, StorageError};

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        debug!("Initializing S3 store with config: {:?}", config);

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "epc-ingest-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!("S3 store initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.key_prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        })
    }

    fn strip_prefix<'k>(&self, full: &'k str) -> &'k str {
        match &self.prefix {
            Some(prefix) => full
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full),
            None => full,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn location(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<PutReceipt, StorageError> {
        let full_key = self.full_key(key)?;
        let receipt = PutReceipt::for_data(key, &data);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::backend("put", key, DisplayErrorContext(e)))?;

        debug!("Uploaded {} bytes to s3://{}/{}", receipt.size, self.bucket, full_key);
        Ok(receipt)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let full_key = self.full_key(key)?;

        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    return Ok(None);
                }
                return Err(StorageError::backend("get", key, DisplayErrorContext(e)));
            },
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend("get", key, DisplayErrorContext(e)))?
            .into_bytes()
            .to_vec();

        Ok(Some(data))
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full_key = self.full_key(key)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(StorageError::backend("head", key, DisplayErrorContext(e)))
                }
            },
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = match &self.prefix {
            Some(root) => format!("{}/{}", root, prefix),
            None => prefix.to_string(),
        };

        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::backend("list", prefix, DisplayErrorContext(e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|k| self.strip_prefix(k).to_string()),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::backend("delete", key, DisplayErrorContext(e)))?;

        debug!("Deleted s3://{}/{}", self.bucket, full_key);
        Ok(())
    }
}
