//! S3-compatible object storage client.
//!
//! Forwards every [`ObjectStorage`] call to an S3 endpoint through the AWS
//! SDK.  SDK failures are reduced to a [`StorageError`] carrying the
//! service's error code and the HTTP status of the response, so that the
//! classification table sees the same values the in-memory store produces.
//!
//! Credentials come from the configuration when both keys are set, and from
//! the standard AWS credential chain (env vars, `~/.aws/credentials`, IAM
//! role, etc.) otherwise.

use std::collections::HashMap;

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, MetadataDirective, ObjectLockEnabled,
    ObjectLockLegalHold, ObjectLockLegalHoldStatus, ObjectLockMode, ObjectLockRetention,
    ObjectLockRetentionMode, Tag, Tagging, TaggingDirective,
};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, info};

use super::backend::{
    ContentHeaders, CopyObjectOutput, CopyObjectRequest, LockMode, ObjectHead, ObjectStorage,
    PutObjectOutput, PutObjectRequest, Retention, StorageFuture, StorageResult, VersionEntry,
    VersionPage,
};
use crate::errors::{codes, StorageError};
use crate::metrics::REMOTE_CALLS_TOTAL;
use crate::tags::TagSet;

/// Region S3 reports as an empty location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Returned by retention and legal-hold reads on versions without either.
const NO_SUCH_OBJECT_LOCK_CONFIGURATION: &str = "NoSuchObjectLockConfiguration";

/// Percent-encoding set for the `x-amz-copy-source` header: everything
/// except unreserved characters and '/'.
const COPY_SOURCE_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// `x-amz-copy-source` value for a bucket, key and optional version.
fn copy_source(bucket: &str, key: &str, version_id: Option<&str>) -> String {
    let path = utf8_percent_encode(&format!("{bucket}/{key}"), &COPY_SOURCE_ENCODE_SET).to_string();
    match version_id {
        Some(version) => format!("{path}?versionId={}", utf8_percent_encode(version, NON_ALPHANUMERIC)),
        None => path,
    }
}

/// Connection settings for [`S3Storage`].
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Endpoint URL; `None` uses the AWS endpoint for the region.
    pub endpoint_url: Option<String>,
    /// Signing region.
    pub region: String,
    /// Explicit access key id.
    pub access_key_id: Option<String>,
    /// Explicit secret access key.
    pub secret_access_key: Option<String>,
    /// Address buckets as a path segment instead of a subdomain.
    pub force_path_style: bool,
}

/// [`ObjectStorage`] backed by an S3-compatible service.
pub struct S3Storage {
    /// AWS S3 SDK client.
    client: Client,
    /// Region used for bucket creation.
    region: String,
}

impl S3Storage {
    /// Build the SDK client.  No request is made.
    pub async fn new(settings: S3Settings) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let Some(ref endpoint) = settings.endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ak), Some(sk)) = (&settings.access_key_id, &settings.secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(ak, sk, None, None, "storeconverge-config");
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style)
            .build();

        info!(
            region = %settings.region,
            endpoint = settings.endpoint_url.as_deref().unwrap_or("default"),
            "S3 object storage client initialized"
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            region: settings.region,
        })
    }

    /// Base64 MD5 digest for the `Content-MD5` header.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }
}

/// Record the call and reduce an SDK failure to a [`StorageError`].
fn observe<T, E>(operation: &'static str, result: Result<T, SdkError<E, HttpResponse>>) -> StorageResult<T>
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(REMOTE_CALLS_TOTAL, "api" => "storage", "operation" => operation, "outcome" => outcome)
        .increment(1);
    result.map_err(|err| {
        let error = map_sdk_error(&err);
        debug!(operation, code = %error.code, status = error.status, "S3 call failed");
        error
    })
}

fn map_sdk_error<E>(err: &SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16()).unwrap_or(0);
    let code = match err.code() {
        Some(code) if !code.is_empty() => code.to_string(),
        _ if status == 404 => codes::NOT_FOUND.to_string(),
        _ if status == 0 => codes::TRANSPORT.to_string(),
        _ => http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("UnknownError")
            .to_string(),
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| aws_sdk_s3::error::DisplayErrorContext(err).to_string());
    StorageError::new(code, status, message)
}

fn bad_request(err: impl std::fmt::Display) -> StorageError {
    StorageError::new(codes::BAD_REQUEST, 0, err.to_string())
}

fn to_smithy(at: DateTime<Utc>) -> SmithyDateTime {
    SmithyDateTime::from_secs(at.timestamp())
}

fn to_chrono(at: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(at.secs(), at.subsec_nanos())
}

fn tagging(tags: &TagSet) -> StorageResult<Tagging> {
    let tag_set = tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(bad_request))
        .collect::<StorageResult<Vec<_>>>()?;
    Tagging::builder().set_tag_set(Some(tag_set)).build().map_err(bad_request)
}

fn tag_set(tags: &[Tag]) -> TagSet {
    tags.iter()
        .map(|t| (t.key().to_string(), t.value().to_string()))
        .collect()
}

fn region_from_constraint(constraint: Option<&BucketLocationConstraint>) -> String {
    match constraint.map(BucketLocationConstraint::as_str) {
        None | Some("") => DEFAULT_REGION.to_string(),
        Some(region) => region.to_string(),
    }
}

fn entry(key: Option<&str>, version_id: Option<&str>, is_latest: Option<bool>) -> VersionEntry {
    VersionEntry {
        key: key.unwrap_or_default().to_string(),
        version_id: version_id.unwrap_or("null").to_string(),
        is_latest: is_latest.unwrap_or(false),
    }
}

impl ObjectStorage for S3Storage {
    fn create_bucket<'a>(&'a self, bucket: &'a str, object_lock: bool) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            debug!(bucket, object_lock, "S3 create_bucket");
            let mut request = self
                .client
                .create_bucket()
                .bucket(bucket)
                .object_lock_enabled_for_bucket(object_lock);
            if self.region != DEFAULT_REGION {
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                        .build(),
                );
            }
            observe("create_bucket", request.send().await)?;
            Ok(())
        })
    }

    fn head_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            observe("head_bucket", self.client.head_bucket().bucket(bucket).send().await)?;
            Ok(())
        })
    }

    fn bucket_region<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, String> {
        Box::pin(async move {
            let resp = observe(
                "get_bucket_location",
                self.client.get_bucket_location().bucket(bucket).send().await,
            )?;
            Ok(region_from_constraint(resp.location_constraint()))
        })
    }

    fn bucket_object_lock<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            let result = observe(
                "get_object_lock_configuration",
                self.client.get_object_lock_configuration().bucket(bucket).send().await,
            );
            match result {
                Ok(resp) => Ok(resp
                    .object_lock_configuration()
                    .and_then(|c| c.object_lock_enabled())
                    .is_some_and(|e| *e == ObjectLockEnabled::Enabled)),
                Err(err) if err.is_code(codes::OBJECT_LOCK_CONFIGURATION_NOT_FOUND) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            debug!(bucket, "S3 delete_bucket");
            observe("delete_bucket", self.client.delete_bucket().bucket(bucket).send().await)?;
            Ok(())
        })
    }

    fn get_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, TagSet> {
        Box::pin(async move {
            let resp = observe(
                "get_bucket_tagging",
                self.client.get_bucket_tagging().bucket(bucket).send().await,
            )?;
            Ok(tag_set(resp.tag_set()))
        })
    }

    fn put_bucket_tagging<'a>(&'a self, bucket: &'a str, tags: &'a TagSet) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let tagging = tagging(tags)?;
            observe(
                "put_bucket_tagging",
                self.client
                    .put_bucket_tagging()
                    .bucket(bucket)
                    .tagging(tagging)
                    .send()
                    .await,
            )?;
            Ok(())
        })
    }

    fn delete_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            observe(
                "delete_bucket_tagging",
                self.client.delete_bucket_tagging().bucket(bucket).send().await,
            )?;
            Ok(())
        })
    }

    fn put_object(&self, request: PutObjectRequest) -> StorageFuture<'_, PutObjectOutput> {
        Box::pin(async move {
            debug!(bucket = %request.bucket, key = %request.key, size = request.body.len(), "S3 put_object");
            let mut call = self
                .client
                .put_object()
                .bucket(&request.bucket)
                .key(&request.key)
                .content_md5(Self::content_md5(&request.body))
                .set_content_type(request.content_type)
                .set_tagging(request.tagging)
                .body(ByteStream::from(request.body));
            if !request.metadata.is_empty() {
                call = call.set_metadata(Some(request.metadata.into_iter().collect::<HashMap<_, _>>()));
            }
            if let Some(retention) = request.retention {
                call = call
                    .object_lock_mode(ObjectLockMode::from(retention.mode.as_str()))
                    .object_lock_retain_until_date(to_smithy(retention.until));
            }
            if request.legal_hold {
                call = call.object_lock_legal_hold_status(ObjectLockLegalHoldStatus::On);
            }

            let resp = observe("put_object", call.send().await)?;
            Ok(PutObjectOutput {
                etag: resp.e_tag().unwrap_or_default().to_string(),
                version_id: resp.version_id().map(str::to_string),
            })
        })
    }

    fn copy_object(&self, request: CopyObjectRequest) -> StorageFuture<'_, CopyObjectOutput> {
        Box::pin(async move {
            let source = copy_source(
                &request.source_bucket,
                &request.source_key,
                request.source_version_id.as_deref(),
            );
            debug!(bucket = %request.bucket, key = %request.key, %source, "S3 copy_object");
            let conditions = request.conditions;
            let mut call = self
                .client
                .copy_object()
                .bucket(&request.bucket)
                .key(&request.key)
                .copy_source(source)
                .set_content_type(request.content_type)
                .set_cache_control(request.headers.cache_control)
                .set_content_disposition(request.headers.content_disposition)
                .set_content_encoding(request.headers.content_encoding)
                .set_content_language(request.headers.content_language)
                .set_metadata_directive(request.metadata_directive.map(|d| MetadataDirective::from(d.as_str())))
                .set_tagging(request.tagging)
                .set_tagging_directive(request.tagging_directive.map(|d| TaggingDirective::from(d.as_str())))
                .set_copy_source_if_match(conditions.if_match)
                .set_copy_source_if_none_match(conditions.if_none_match)
                .set_copy_source_if_modified_since(conditions.if_modified_since.map(to_smithy))
                .set_copy_source_if_unmodified_since(conditions.if_unmodified_since.map(to_smithy));
            if !request.metadata.is_empty() {
                call = call.set_metadata(Some(request.metadata.into_iter().collect::<HashMap<_, _>>()));
            }

            let resp = observe("copy_object", call.send().await)?;
            let result = resp.copy_object_result();
            Ok(CopyObjectOutput {
                etag: result.and_then(|r| r.e_tag()).unwrap_or_default().to_string(),
                last_modified: result.and_then(|r| r.last_modified()).and_then(to_chrono),
                version_id: resp.version_id().map(str::to_string),
                source_version_id: resp.copy_source_version_id().map(str::to_string),
            })
        })
    }

    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, ObjectHead> {
        Box::pin(async move {
            let resp = observe(
                "head_object",
                self.client
                    .head_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string))
                    .send()
                    .await,
            )?;

            let retention = match (resp.object_lock_mode(), resp.object_lock_retain_until_date()) {
                (Some(mode), Some(until)) => LockMode::parse(mode.as_str())
                    .zip(to_chrono(until))
                    .map(|(mode, until)| Retention { mode, until }),
                _ => None,
            };

            Ok(ObjectHead {
                etag: resp.e_tag().unwrap_or_default().to_string(),
                version_id: resp.version_id().map(str::to_string),
                content_type: resp.content_type().map(str::to_string),
                headers: ContentHeaders {
                    cache_control: resp.cache_control().map(str::to_string),
                    content_disposition: resp.content_disposition().map(str::to_string),
                    content_encoding: resp.content_encoding().map(str::to_string),
                    content_language: resp.content_language().map(str::to_string),
                },
                content_length: resp.content_length().unwrap_or(0),
                last_modified: resp.last_modified().and_then(to_chrono),
                metadata: resp
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
                retention,
                legal_hold: resp.object_lock_legal_hold_status() == Some(&ObjectLockLegalHoldStatus::On),
                delete_marker: resp.delete_marker().unwrap_or(false),
            })
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Bytes> {
        Box::pin(async move {
            let resp = observe(
                "get_object",
                self.client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string))
                    .send()
                    .await,
            )?;
            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| StorageError::new(codes::TRANSPORT, 0, format!("reading object body: {e}")))?;
            Ok(body.into_bytes())
        })
    }

    fn delete_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            debug!(bucket, key, ?version_id, bypass_governance, "S3 delete_object");
            let mut call = self
                .client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .set_version_id(version_id.map(str::to_string));
            if bypass_governance {
                call = call.bypass_governance_retention(true);
            }
            observe("delete_object", call.send().await)?;
            Ok(())
        })
    }

    fn list_object_versions<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
        key_marker: Option<&'a str>,
        version_id_marker: Option<&'a str>,
    ) -> StorageFuture<'a, VersionPage> {
        Box::pin(async move {
            let resp = observe(
                "list_object_versions",
                self.client
                    .list_object_versions()
                    .bucket(bucket)
                    .set_prefix(prefix.map(str::to_string))
                    .set_key_marker(key_marker.map(str::to_string))
                    .set_version_id_marker(version_id_marker.map(str::to_string))
                    .send()
                    .await,
            )?;

            Ok(VersionPage {
                versions: resp
                    .versions()
                    .iter()
                    .map(|v| entry(v.key(), v.version_id(), v.is_latest()))
                    .collect(),
                delete_markers: resp
                    .delete_markers()
                    .iter()
                    .map(|m| entry(m.key(), m.version_id(), m.is_latest()))
                    .collect(),
                is_truncated: resp.is_truncated().unwrap_or(false),
                next_key_marker: resp.next_key_marker().map(str::to_string),
                next_version_id_marker: resp.next_version_id_marker().map(str::to_string),
            })
        })
    }

    fn get_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, TagSet> {
        Box::pin(async move {
            let resp = observe(
                "get_object_tagging",
                self.client.get_object_tagging().bucket(bucket).key(key).send().await,
            )?;
            Ok(tag_set(resp.tag_set()))
        })
    }

    fn put_object_tagging<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        tags: &'a TagSet,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let tagging = tagging(tags)?;
            observe(
                "put_object_tagging",
                self.client
                    .put_object_tagging()
                    .bucket(bucket)
                    .key(key)
                    .tagging(tagging)
                    .send()
                    .await,
            )?;
            Ok(())
        })
    }

    fn delete_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            observe(
                "delete_object_tagging",
                self.client.delete_object_tagging().bucket(bucket).key(key).send().await,
            )?;
            Ok(())
        })
    }

    fn get_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Option<Retention>> {
        Box::pin(async move {
            let result = observe(
                "get_object_retention",
                self.client
                    .get_object_retention()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string))
                    .send()
                    .await,
            );
            let resp = match result {
                Ok(resp) => resp,
                Err(err) if err.is_code(NO_SUCH_OBJECT_LOCK_CONFIGURATION) => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(resp.retention().and_then(|r| {
                let mode = LockMode::parse(r.mode()?.as_str())?;
                let until = to_chrono(r.retain_until_date()?)?;
                Some(Retention { mode, until })
            }))
        })
    }

    fn put_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let body = match retention {
                Some(r) => ObjectLockRetention::builder()
                    .mode(ObjectLockRetentionMode::from(r.mode.as_str()))
                    .retain_until_date(to_smithy(r.until))
                    .build(),
                None => ObjectLockRetention::builder().build(),
            };
            let mut call = self
                .client
                .put_object_retention()
                .bucket(bucket)
                .key(key)
                .set_version_id(version_id.map(str::to_string))
                .retention(body);
            if bypass_governance {
                call = call.bypass_governance_retention(true);
            }
            observe("put_object_retention", call.send().await)?;
            Ok(())
        })
    }

    fn get_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            let result = observe(
                "get_object_legal_hold",
                self.client
                    .get_object_legal_hold()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string))
                    .send()
                    .await,
            );
            match result {
                Ok(resp) => Ok(resp
                    .legal_hold()
                    .and_then(|h| h.status())
                    .is_some_and(|s| *s == ObjectLockLegalHoldStatus::On)),
                Err(err) if err.is_code(NO_SUCH_OBJECT_LOCK_CONFIGURATION) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn put_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        on: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let status = if on {
                ObjectLockLegalHoldStatus::On
            } else {
                ObjectLockLegalHoldStatus::Off
            };
            observe(
                "put_object_legal_hold",
                self.client
                    .put_object_legal_hold()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string))
                    .legal_hold(ObjectLockLegalHold::builder().status(status).build())
                    .send()
                    .await,
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_content_md5_is_base64() {
        // MD5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(S3Storage::content_md5(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_datetime_conversion_keeps_seconds() {
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(to_chrono(&to_smithy(at)), Some(at));
    }

    #[test]
    fn test_copy_source_escapes_key_but_not_slashes() {
        assert_eq!(copy_source("src", "dir/a b+c.txt", None), "src/dir/a%20b%2Bc.txt");
        assert_eq!(copy_source("src", "a.txt", Some("3/L4")), "src/a.txt?versionId=3%2FL4");
    }

    #[test]
    fn test_empty_location_constraint_is_default_region() {
        assert_eq!(region_from_constraint(None), DEFAULT_REGION);
        let eu = BucketLocationConstraint::from("eu-west-1");
        assert_eq!(region_from_constraint(Some(&eu)), "eu-west-1");
    }

    #[test]
    fn test_tagging_keeps_every_pair() {
        let tags: TagSet = [("env".to_string(), "prod".to_string()), ("team".to_string(), "a b".to_string())]
            .into_iter()
            .collect();
        let tagging = tagging(&tags).unwrap();
        assert_eq!(tag_set(tagging.tag_set()), tags);
    }

    #[tokio::test]
    async fn test_new_with_static_credentials() {
        let storage = S3Storage::new(S3Settings {
            endpoint_url: Some("http://127.0.0.1:9".into()),
            region: "eu-west-1".into(),
            access_key_id: Some("AK".into()),
            secret_access_key: Some("SK".into()),
            force_path_style: true,
        })
        .await
        .unwrap();
        assert_eq!(storage.region, "eu-west-1");
    }
}
