use super::{CompletedPartInfo, ObjectStore, SourceObject};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Implementation of [`ObjectStore`] for S3 and S3-compatible APIs
#[derive(Debug)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub async fn new(config: &Config) -> Self {
        let region_provider = match &config.region {
            Some(region) => RegionProviderChain::first_try(Region::new(region.clone()))
                .or_default_provider()
                .or_else("us-east-1"),
            None => RegionProviderChain::default_provider().or_else("us-east-1"),
        };

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(s3_endpoint) = &config.s3_endpoint {
            // Non-AWS S3-compatible services need path-style addressing, since virtual-hosted
            // style assumes the AWS DNS layout
            s3_config_builder = s3_config_builder
                .endpoint_url(s3_endpoint.to_string())
                .force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config_builder.build()),
        }
    }
}

fn to_chrono(timestamp: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<SourceObject>> {
        debug!(bucket, prefix, "Listing objects");

        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.with_context(|_| crate::error::ListObjectsSnafu {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })?;

            for object in page.contents() {
                let key = match object.key() {
                    Some(key) => key.to_string(),
                    // Never observed in the wild, but the SDK models the key as optional
                    None => continue,
                };

                objects.push(SourceObject {
                    bucket: bucket.to_string(),
                    key,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    etag: object.e_tag().map(|etag| etag.to_string()),
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }
        }

        debug!(bucket, prefix, count = objects.len(), "Listed objects");

        Ok(objects)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<SourceObject> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::HeadObjectSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(SourceObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            etag: response.e_tag().map(|etag| etag.to_string()),
            last_modified: response.last_modified().and_then(to_chrono),
        })
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        response
            .upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| {
                crate::error::MissingUploadIdSnafu {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
                .build()
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPartInfo> {
        debug!(bucket, key, part_number, len = data.len(), "UploadPart");

        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
            })?;

        let etag = response.e_tag().map(|etag| etag.to_string()).ok_or_else(|| {
            crate::error::MissingPartEtagSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
            }
            .build()
        })?;

        Ok(CompletedPartInfo { part_number, etag })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        src_bucket: &str,
        src_key: &str,
        range: Range<u64>,
    ) -> Result<CompletedPartInfo> {
        let copy_source_range = super::copy_source_range(&range);

        debug!(
            bucket,
            key, part_number, src_bucket, src_key, %copy_source_range, "UploadPartCopy"
        );

        let response = self
            .client
            .upload_part_copy()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(format!("{src_bucket}/{src_key}"))
            .copy_source_range(&copy_source_range)
            .send()
            .await
            .with_context(|_| crate::error::UploadPartCopySnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
                src_bucket: src_bucket.to_string(),
                src_key: src_key.to_string(),
                range: copy_source_range.clone(),
            })?;

        let etag = response
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .map(|etag| etag.to_string())
            .ok_or_else(|| {
                crate::error::MissingPartEtagSnafu {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    part_number,
                }
                .build()
            })?;

        Ok(CompletedPartInfo { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartInfo>,
    ) -> Result<Option<String>> {
        debug!(bucket, key, parts = parts.len(), "CompleteMultipartUpload");

        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(response.e_tag().map(|etag| etag.to_string()))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        debug!(bucket, key, "AbortMultipartUpload");

        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<()> {
        debug!(bucket, count = keys.len(), "DeleteObjects");

        let objects = keys
            .into_iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .expect("BUG: the object key is always set")
            })
            .collect::<Vec<_>>();

        self.client
            .delete_objects()
            .bucket(bucket)
            .delete(
                Delete::builder()
                    .set_objects(Some(objects))
                    .build()
                    .expect("BUG: the object list is always set"),
            )
            .send()
            .await
            .with_context(|_| crate::error::DeleteObjectsSnafu {
                bucket: bucket.to_string(),
            })?;

        Ok(())
    }
}
