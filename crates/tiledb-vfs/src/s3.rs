//! S3 backend.
//!
//! The SDK client is async; the backend owns a tokio runtime and blocks on
//! each call so the VFS surface stays synchronous. Writes buffer in memory
//! per URI and flush as multipart parts once the buffer reaches the
//! configured size; durability happens only at [`S3::flush_file`], which
//! completes the upload. Objects have no directories, so a "directory" is a
//! key prefix ending in `/`, optionally held down by an empty marker object.

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
    CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use dashmap::DashMap;
use tokio::runtime::Runtime;

use tiledb_common::{log_status, Result, S3Config, Status, Uri};

use crate::backend::Backend;

/// Pending write state for one URI.
#[derive(Default)]
struct FileBuffer {
    data: Vec<u8>,
    upload: Option<MultipartUpload>,
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
    next_part_number: i32,
}

pub struct S3 {
    client: Client,
    runtime: Runtime,
    region: String,
    file_buffer_size: usize,
    file_buffers: DashMap<String, FileBuffer>,
}

impl S3 {
    /// Build a client from the configuration.
    ///
    /// The client is not explicitly shut down at drop; tearing down the
    /// connection pool has been observed to hang, so it is released as-is.
    pub fn connect(config: &S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                log_status(Status::vfs_error(format!(
                    "s3: cannot start client runtime: {}",
                    e
                )))
            })?;

        let shared = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load(),
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .operation_timeout(Duration::from_millis(config.request_timeout_ms))
            .build();

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(!config.use_virtual_addressing)
            .timeout_config(timeouts);
        if let Some(endpoint) = &config.endpoint_override {
            let endpoint = if endpoint.contains("://") {
                endpoint.clone()
            } else {
                format!("{}://{}", config.scheme, endpoint)
            };
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            runtime,
            region: config.region.clone(),
            file_buffer_size: config.file_buffer_size as usize,
            file_buffers: DashMap::new(),
        })
    }

    /// Split `s3://bucket/key` into bucket and key; the key may be empty.
    fn parse(uri: &Uri) -> Result<(String, String)> {
        let rest = uri.as_str().strip_prefix("s3://").ok_or_else(|| {
            log_status(Status::invalid_argument(format!("not an S3 URI: '{}'", uri)))
        })?;
        match rest.split_once('/') {
            Some((bucket, key)) => Ok((bucket.to_string(), key.to_string())),
            None => Ok((rest.to_string(), String::new())),
        }
    }

    fn sdk_status(op: &str, target: &str, e: impl std::fmt::Display) -> Status {
        log_status(Status::vfs_error(format!(
            "s3: cannot {} '{}': {}",
            op, target, e
        )))
    }

    /// Key prefix with a guaranteed trailing delimiter; empty for the bucket
    /// root.
    fn dir_prefix(key: &str) -> String {
        if key.is_empty() || key.ends_with('/') {
            key.to_string()
        } else {
            format!("{}/", key)
        }
    }

    pub fn create_bucket(&self, uri: &Uri) -> Result<()> {
        let (bucket, _) = Self::parse(uri)?;
        self.runtime.block_on(async {
            let mut request = self.client.create_bucket().bucket(&bucket);
            if self.region != "us-east-1" {
                let constraint = BucketLocationConstraint::from(self.region.as_str());
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(constraint)
                        .build(),
                );
            }
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|e| Self::sdk_status("create bucket", &bucket, e))
        })
    }

    pub fn remove_bucket(&self, uri: &Uri) -> Result<()> {
        let (bucket, _) = Self::parse(uri)?;
        self.runtime.block_on(async {
            self.client
                .delete_bucket()
                .bucket(&bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| Self::sdk_status("remove bucket", &bucket, e))
        })
    }

    pub fn empty_bucket(&self, uri: &Uri) -> Result<()> {
        let (bucket, _) = Self::parse(uri)?;
        self.delete_by_prefix(&bucket, "")
    }

    pub fn is_empty_bucket(&self, uri: &Uri) -> Result<bool> {
        let (bucket, _) = Self::parse(uri)?;
        self.runtime.block_on(async {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .max_keys(1)
                .send()
                .await
                .map_err(|e| Self::sdk_status("inspect bucket", &bucket, e))?;
            Ok(response.contents().is_empty())
        })
    }

    pub fn is_bucket(&self, uri: &Uri) -> bool {
        let Ok((bucket, _)) = Self::parse(uri) else {
            return false;
        };
        self.runtime.block_on(async {
            self.client
                .head_bucket()
                .bucket(&bucket)
                .send()
                .await
                .is_ok()
        })
    }

    /// Complete the buffered write for this URI: upload any remaining bytes
    /// and finish the multipart upload, or issue a single put for files that
    /// never crossed the buffer size. A URI with no pending writes is ok.
    pub fn flush_file(&self, uri: &Uri) -> Result<()> {
        let (bucket, key) = Self::parse(uri)?;
        let Some((_uri, mut state)) = self.file_buffers.remove(uri.as_str()) else {
            return Ok(());
        };
        match state.upload.take() {
            None => self.put_whole(&bucket, &key, state.data),
            Some(mut upload) => {
                let remainder = std::mem::take(&mut state.data);
                if !remainder.is_empty() {
                    self.send_part(&bucket, &key, &mut upload, remainder)?;
                }
                self.runtime.block_on(async {
                    let completed = CompletedMultipartUpload::builder()
                        .set_parts(Some(upload.parts))
                        .build();
                    self.client
                        .complete_multipart_upload()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload.upload_id)
                        .multipart_upload(completed)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| Self::sdk_status("complete upload of", &key, e))
                })
            }
        }
    }

    fn put_whole(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| Self::sdk_status("write", key, e))
        })
    }

    fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<MultipartUpload> {
        self.runtime.block_on(async {
            let response = self
                .client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::sdk_status("start upload of", key, e))?;
            match response.upload_id() {
                Some(upload_id) if !upload_id.is_empty() => Ok(MultipartUpload {
                    upload_id: upload_id.to_string(),
                    parts: Vec::new(),
                    next_part_number: 1,
                }),
                _ => Err(Self::sdk_status("start upload of", key, "no upload id")),
            }
        })
    }

    fn send_part(
        &self,
        bucket: &str,
        key: &str,
        upload: &mut MultipartUpload,
        data: Vec<u8>,
    ) -> Result<()> {
        let part_number = upload.next_part_number;
        self.runtime.block_on(async {
            let response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload.upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::sdk_status("upload part of", key, e))?;
            upload.parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .build(),
            );
            upload.next_part_number += 1;
            Ok(())
        })
    }

    /// Delete every object under `prefix`, in batches.
    fn delete_by_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
        self.runtime.block_on(async {
            let mut continuation: Option<String> = None;
            loop {
                let mut request = self.client.list_objects_v2().bucket(bucket);
                if !prefix.is_empty() {
                    request = request.prefix(prefix);
                }
                if let Some(token) = &continuation {
                    request = request.continuation_token(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| Self::sdk_status("list", bucket, e))?;

                let mut objects = Vec::new();
                for object in response.contents() {
                    if let Some(key) = object.key() {
                        objects.push(
                            ObjectIdentifier::builder()
                                .key(key)
                                .build()
                                .map_err(|e| Self::sdk_status("delete under", prefix, e))?,
                        );
                    }
                }
                if !objects.is_empty() {
                    let delete = Delete::builder()
                        .set_objects(Some(objects))
                        .build()
                        .map_err(|e| Self::sdk_status("delete under", prefix, e))?;
                    self.client
                        .delete_objects()
                        .bucket(bucket)
                        .delete(delete)
                        .send()
                        .await
                        .map_err(|e| Self::sdk_status("delete under", prefix, e))?;
                }

                if response.is_truncated() == Some(true) {
                    continuation = response.next_continuation_token().map(str::to_string);
                } else {
                    return Ok(());
                }
            }
        })
    }

    fn head_size(&self, bucket: &str, key: &str) -> Result<u64> {
        self.runtime.block_on(async {
            let response = self
                .client
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    log_status(Status::not_found(format!(
                        "s3: cannot stat '{}/{}': {}",
                        bucket, key, e
                    )))
                })?;
            Ok(response.content_length().unwrap_or(0) as u64)
        })
    }
}

impl Backend for S3 {
    fn create_dir(&self, uri: &Uri) -> Result<()> {
        // No real directories; drop an empty marker object at `key/`.
        let (bucket, key) = Self::parse(uri)?;
        self.put_whole(&bucket, &Self::dir_prefix(&key), Vec::new())
    }

    fn create_file(&self, uri: &Uri) -> Result<()> {
        let (bucket, key) = Self::parse(uri)?;
        self.put_whole(&bucket, &key, Vec::new())
    }

    fn remove_path(&self, uri: &Uri) -> Result<()> {
        let (bucket, key) = Self::parse(uri)?;
        self.delete_by_prefix(&bucket, &Self::dir_prefix(&key))?;
        // A plain object at the bare key is part of the path too.
        if !key.is_empty() && self.is_file(uri) {
            return self.remove_file(uri);
        }
        Ok(())
    }

    fn remove_file(&self, uri: &Uri) -> Result<()> {
        let (bucket, key) = Self::parse(uri)?;
        // Deletes of absent keys succeed on S3; probe first so a missing
        // file surfaces as not-found like every other backend.
        if !self.is_file(uri) {
            return Err(log_status(Status::not_found(format!(
                "s3: cannot remove file '{}': no such key",
                uri
            ))));
        }
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| Self::sdk_status("remove file", &key, e))
        })
    }

    fn file_size(&self, uri: &Uri) -> Result<u64> {
        let (bucket, key) = Self::parse(uri)?;
        self.head_size(&bucket, &key)
    }

    fn is_dir(&self, uri: &Uri) -> bool {
        // At least one object lives under the prefix + delimiter.
        let Ok((bucket, key)) = Self::parse(uri) else {
            return false;
        };
        let prefix = Self::dir_prefix(&key);
        self.runtime.block_on(async {
            let mut request = self.client.list_objects_v2().bucket(&bucket).max_keys(1);
            if !prefix.is_empty() {
                request = request.prefix(&prefix);
            }
            match request.send().await {
                Ok(response) => !response.contents().is_empty(),
                Err(_) => false,
            }
        })
    }

    fn is_file(&self, uri: &Uri) -> bool {
        let Ok((bucket, key)) = Self::parse(uri) else {
            return false;
        };
        if key.is_empty() {
            return false;
        }
        self.runtime.block_on(async {
            self.client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .is_ok()
        })
    }

    fn ls(&self, parent: &Uri) -> Result<Vec<String>> {
        let (bucket, key) = Self::parse(parent)?;
        let prefix = Self::dir_prefix(&key);
        self.runtime.block_on(async {
            let mut children = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .delimiter("/");
                if !prefix.is_empty() {
                    request = request.prefix(&prefix);
                }
                if let Some(token) = &continuation {
                    request = request.continuation_token(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| Self::sdk_status("list", parent.as_str(), e))?;

                for common in response.common_prefixes() {
                    if let Some(dir) = common.prefix() {
                        children.push(format!(
                            "s3://{}/{}",
                            bucket,
                            dir.trim_end_matches('/')
                        ));
                    }
                }
                for object in response.contents() {
                    match object.key() {
                        // The marker object of the listed prefix is not a child.
                        Some(child) if child != prefix => {
                            children.push(format!("s3://{}/{}", bucket, child));
                        }
                        _ => {}
                    }
                }

                if response.is_truncated() == Some(true) {
                    continuation = response.next_continuation_token().map(str::to_string);
                } else {
                    return Ok(children);
                }
            }
        })
    }

    fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let (bucket, key) = Self::parse(uri)?;
        let range = format!("bytes={}-{}", offset, offset + buffer.len() as u64 - 1);
        self.runtime.block_on(async {
            let response = self
                .client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .range(range)
                .send()
                .await
                .map_err(|e| Self::sdk_status("read", &key, e))?;
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| Self::sdk_status("read body of", &key, e))?
                .into_bytes();
            if data.len() != buffer.len() {
                return Err(log_status(Status::vfs_error(format!(
                    "s3: cannot read '{}': requested {} bytes at offset {}, got {}",
                    uri,
                    buffer.len(),
                    offset,
                    data.len()
                ))));
            }
            buffer.copy_from_slice(&data);
            Ok(())
        })
    }

    fn write(&self, uri: &Uri, buffer: &[u8]) -> Result<()> {
        let (bucket, key) = Self::parse(uri)?;
        let mut entry = self
            .file_buffers
            .entry(uri.as_str().to_string())
            .or_default();
        entry.data.extend_from_slice(buffer);
        while entry.data.len() >= self.file_buffer_size {
            let part: Vec<u8> = entry.data.drain(..self.file_buffer_size).collect();
            let state = entry.value_mut();
            if state.upload.is_none() {
                state.upload = Some(self.initiate_multipart(&bucket, &key)?);
            }
            if let Some(upload) = state.upload.as_mut() {
                self.send_part(&bucket, &key, upload, part)?;
            }
        }
        Ok(())
    }

    fn sync(&self, uri: &Uri) -> Result<()> {
        // Durability is only achieved at flush_file.
        let _ = uri;
        Ok(())
    }

    fn move_path(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()> {
        let (old_bucket, old_key) = Self::parse(old_uri)?;
        let (new_bucket, new_key) = Self::parse(new_uri)?;

        if self.is_file(old_uri) {
            self.copy_and_delete(&old_bucket, &old_key, &new_bucket, &new_key)
        } else {
            let old_prefix = Self::dir_prefix(&old_key);
            let new_prefix = Self::dir_prefix(&new_key);
            let children = self.keys_under(&old_bucket, &old_prefix)?;
            for child in children {
                let suffix = child[old_prefix.len()..].to_string();
                let target = format!("{}{}", new_prefix, suffix);
                self.copy_and_delete(&old_bucket, &child, &new_bucket, &target)?;
            }
            Ok(())
        }
    }
}

impl S3 {
    fn keys_under(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let mut request = self.client.list_objects_v2().bucket(bucket);
                if !prefix.is_empty() {
                    request = request.prefix(prefix);
                }
                if let Some(token) = &continuation {
                    request = request.continuation_token(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| Self::sdk_status("list", bucket, e))?;
                keys.extend(
                    response
                        .contents()
                        .iter()
                        .filter_map(|o| o.key())
                        .map(str::to_string),
                );
                if response.is_truncated() == Some(true) {
                    continuation = response.next_continuation_token().map(str::to_string);
                } else {
                    return Ok(keys);
                }
            }
        })
    }

    fn copy_and_delete(
        &self,
        old_bucket: &str,
        old_key: &str,
        new_bucket: &str,
        new_key: &str,
    ) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .copy_object()
                .copy_source(format!("{}/{}", old_bucket, old_key))
                .bucket(new_bucket)
                .key(new_key)
                .send()
                .await
                .map_err(|e| Self::sdk_status("copy", old_key, e))?;
            self.client
                .delete_object()
                .bucket(old_bucket)
                .key(old_key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| Self::sdk_status("remove after copy", old_key, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_and_key() {
        let (bucket, key) = S3::parse(&Uri::new("s3://bucket/a/b.bin")).unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "a/b.bin");

        let (bucket, key) = S3::parse(&Uri::new("s3://bucket")).unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "");

        assert!(S3::parse(&Uri::new("/local/path")).is_err());
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(S3::dir_prefix(""), "");
        assert_eq!(S3::dir_prefix("a"), "a/");
        assert_eq!(S3::dir_prefix("a/"), "a/");
    }
}
