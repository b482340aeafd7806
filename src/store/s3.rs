//! S3 backend built on aws-sdk-s3

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::{ObjectMetadata, ObjectStore, PutObject, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

/// Object store backed by an S3 bucket
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the default AWS credential chain
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        // Custom endpoints (MinIO and friends) rarely support virtual-host addressing
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint_url.is_some())
            .build();

        S3Store {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Some(output.metadata().cloned().unwrap_or_default())),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                debug!("head {}: not found", key);
                Ok(None)
            }
            Err(e) => Err(Error::store("head", key, DisplayErrorContext(&e))),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => return Err(Error::store("get", key, DisplayErrorContext(&e))),
        };

        let metadata = output.metadata().cloned().unwrap_or_default();
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| Error::store("get", key, e))?
            .into_bytes();

        Ok(Some(StoredObject { body, metadata }))
    }

    async fn put_object(&self, key: &str, object: PutObject) -> Result<()> {
        debug!("put {} ({} bytes)", key, object.body.len());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(object.body))
            .set_metadata(Some(object.metadata))
            .set_checksum_sha1(object.payload_sha1)
            .send()
            .await
            .map_err(|e| Error::store("put", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            trimmed => format!("{}/", trimmed),
        };
        let mut names = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Error::store("list", &prefix, DisplayErrorContext(&e)))?;
            for common in page.common_prefixes() {
                if let Some(name) = common
                    .prefix()
                    .and_then(|p| p.strip_prefix(&prefix))
                    .map(|p| p.trim_end_matches('/'))
                {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }
}
