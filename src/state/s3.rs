//! S3-based state storage backend.
//!
//! Layout: `<prefix>/<stack>/state.json` and `<prefix>/<stack>/state.lock`.
//! Each save is a single PUT of the whole snapshot. Every write that depends
//! on what was read is conditional on the object's entity tag, so two
//! processes racing for the same lock or revision cannot both win.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{StateStore, check_lock_free, check_lock_held, check_revision};
use super::types::{AppliedState, STATE_VERSION};

/// State object name.
const STATE_KEY: &str = "state.json";

/// Lock object name.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// An object body and the entity tag it was read at.
struct Versioned {
    content: String,
    etag: Option<String>,
}

/// Condition attached to a PUT.
enum Precondition {
    /// The object must not exist yet.
    Absent,
    /// The object must still carry this entity tag.
    Matches(String),
}

impl Precondition {
    /// Condition that the object is still as it was read.
    fn unchanged(read: Option<&Versioned>) -> Option<Self> {
        match read {
            None => Some(Self::Absent),
            Some(object) => object.etag.clone().map(Self::Matches),
        }
    }
}

impl S3StateStore {
    /// Creates a new S3 state store using the AWS default credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Object key of a stack's file.
    fn key(&self, stack: &str, file: &str) -> String {
        format!("{}{stack}/{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<Versioned>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StackError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(Versioned { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Writes an object. Returns false if `precondition` no longer held.
    async fn put_object(
        &self,
        key: &str,
        content: String,
        precondition: Option<Precondition>,
    ) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json");

        let request = match precondition {
            Some(Precondition::Absent) => request.if_none_match("*"),
            Some(Precondition::Matches(etag)) => request.if_match(etag),
            None => request,
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failure(&e) => {
                debug!("Conditional write to {key} lost a race");
                Ok(false)
            }
            Err(e) => Err(StackError::State(StateError::s3(format!("S3 put error: {e}")))),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn read_state(&self, stack: &str) -> Result<(Option<Versioned>, Option<AppliedState>)> {
        let key = self.key(stack, STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(object) = self.get_object(&key).await? else {
            debug!("No state found in S3 for stack '{stack}'");
            return Ok((None, None));
        };

        let state: AppliedState = parse_json(&object.content, "state")?;
        if state.version != STATE_VERSION {
            return Err(StackError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok((Some(object), Some(state)))
    }

    async fn read_lock(&self, stack: &str) -> Result<(Option<Versioned>, Option<LockInfo>)> {
        let object = self.get_object(&self.key(stack, LOCK_KEY)).await?;
        let lock = object
            .as_ref()
            .map(|o| parse_json(&o.content, "lock"))
            .transpose()?;
        Ok((object, lock))
    }
}

/// S3 answers 412 when a condition fails and 409 when a concurrent
/// conditional write to the same key is in flight.
fn is_precondition_failure<E>(err: &SdkError<E>) -> bool {
    err.raw_response()
        .is_some_and(|response| matches!(response.status().as_u16(), 409 | 412))
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

fn parse_json<T: serde::de::DeserializeOwned>(content: &str, what: &str) -> Result<T> {
    serde_json::from_str(content).map_err(|e| {
        StackError::State(StateError::Corrupted {
            message: format!("Failed to parse {what}: {e}"),
        })
    })
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| {
        StackError::State(StateError::serialization(format!(
            "Failed to serialize {what}: {e}"
        )))
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, stack: &str) -> Result<Option<AppliedState>> {
        let (_, state) = self.read_state(stack).await?;
        if let Some(state) = &state {
            info!("Loaded state for stack '{stack}' at revision {}", state.revision);
        }
        Ok(state)
    }

    async fn save(&self, state: &AppliedState, expected_revision: Option<u64>) -> Result<()> {
        let (object, stored) = self.read_state(&state.stack).await?;
        check_revision(&state.stack, expected_revision, stored.as_ref())?;

        let key = self.key(&state.stack, STATE_KEY);
        info!(
            "Saving state revision {} to s3://{}/{key}",
            state.revision, self.bucket
        );

        let precondition = Precondition::unchanged(object.as_ref());
        if precondition.is_none() {
            warn!("No entity tag on s3://{}/{key}, writing unconditionally", self.bucket);
        }

        if !self.put_object(&key, to_json(state, "state")?, precondition).await? {
            let (_, stored) = self.read_state(&state.stack).await?;
            return Err(StackError::State(StateError::ConcurrentModification {
                stack: state.stack.clone(),
                expected: expected_revision,
                found: stored.map(|s| s.revision),
            }));
        }

        debug!("State saved successfully to S3");
        Ok(())
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        let state_key = self.key(stack, STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(stack, LOCK_KEY)).await
    }

    async fn exists(&self, stack: &str) -> Result<bool> {
        self.object_exists(&self.key(stack, STATE_KEY)).await
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        let (object, existing) = self.read_lock(stack).await?;
        check_lock_free(existing.as_ref())?;
        if existing.is_some() {
            warn!("Expired lock found on stack '{stack}', taking over");
        }

        let lock_info = LockInfo::new(stack, holder);
        let written = self
            .put_object(
                &self.key(stack, LOCK_KEY),
                to_json(&lock_info, "lock")?,
                Precondition::unchanged(object.as_ref()),
            )
            .await?;

        if !written {
            let (_, winner) = self.read_lock(stack).await?;
            check_lock_free(winner.as_ref())?;
            return Err(StackError::State(StateError::LockFailed {
                message: format!("Another process took the lock on stack '{stack}'"),
            }));
        }

        info!(
            "Acquired lock on stack '{stack}': {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        let (object, existing) = self.read_lock(stack).await?;
        let mut lock = check_lock_held(stack, lock_id, existing)?;
        lock.renew();

        let written = self
            .put_object(
                &self.key(stack, LOCK_KEY),
                to_json(&lock, "lock")?,
                Precondition::unchanged(object.as_ref()),
            )
            .await?;
        if !written {
            return Err(StackError::State(StateError::LockFailed {
                message: format!("Lock {lock_id} on stack '{stack}' changed while renewing"),
            }));
        }

        debug!("Renewed lock on stack '{stack}' until {}", lock.expires_at);
        Ok(lock)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        if let (_, Some(existing)) = self.read_lock(stack).await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(stack, LOCK_KEY)).await?;
                info!("Released lock on stack '{stack}': {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self, stack: &str) -> Result<()> {
        warn!("Force-removing lock on stack '{stack}'");
        self.delete_object(&self.key(stack, LOCK_KEY)).await
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        let (_, lock) = self.read_lock(stack).await?;
        Ok(lock)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOCK_PATH: &str = "/infra-state/blog/state.lock";
    const STATE_PATH: &str = "/infra-state/blog/state.json";

    fn store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "infra-state", prefix)
    }

    fn store_for(server: &MockServer) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3StateStore::with_client(Client::from_conf(config), "infra-state", None)
    }

    fn s3_error(status: u16, code: &str) -> ResponseTemplate {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{code}</Code><Message>{code}</Message></Error>"
        );
        ResponseTemplate::new(status).set_body_raw(body, "application/xml")
    }

    fn json_object(body: String, etag: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("ETag", etag)
            .set_body_raw(body, "application/json")
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(store(Some("/stacks/")).key("blog", STATE_KEY), "stacks/blog/state.json");
        assert_eq!(store(Some("")).key("blog", LOCK_KEY), "blog/state.lock");
        assert_eq!(store(None).key("blog", STATE_KEY), "blog/state.json");
    }

    #[test]
    fn test_backend_type() {
        assert_eq!(store(None).backend_type(), "s3");
    }

    #[tokio::test]
    async fn test_free_lock_is_created_only_if_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LOCK_PATH))
            .respond_with(s3_error(404, "NoSuchKey"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(LOCK_PATH))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"l1\""))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store_for(&server).acquire_lock("blog", "me").await.unwrap();
        assert_eq!(lock.holder, "me");
    }

    #[tokio::test]
    async fn test_lock_race_loser_sees_the_winner() {
        let server = MockServer::start().await;
        let winner = LockInfo::new("blog", "rival");

        // Free when first read, held by the rival once our write is refused.
        Mock::given(method("GET"))
            .and(path(LOCK_PATH))
            .respond_with(s3_error(404, "NoSuchKey"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(LOCK_PATH))
            .respond_with(json_object(serde_json::to_string(&winner).unwrap(), "\"l2\""))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(LOCK_PATH))
            .and(header("if-none-match", "*"))
            .respond_with(s3_error(412, "PreconditionFailed"))
            .expect(1)
            .mount(&server)
            .await;

        let err = store_for(&server).acquire_lock("blog", "me").await.unwrap_err();
        assert!(matches!(
            err,
            StackError::State(StateError::LockedByOther { ref holder, .. }) if holder == "rival"
        ));
    }

    #[tokio::test]
    async fn test_save_is_conditional_on_loaded_etag() {
        let server = MockServer::start().await;
        let stored = AppliedState::next("blog", None, crate::graph::ResourceGraph::empty());

        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .respond_with(json_object(serde_json::to_string(&stored).unwrap(), "\"v1\""))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(STATE_PATH))
            .and(header("if-match", "\"v1\""))
            .respond_with(s3_error(412, "PreconditionFailed"))
            .expect(1)
            .mount(&server)
            .await;

        let next = AppliedState::next("blog", Some(&stored), crate::graph::ResourceGraph::empty());
        let err = store_for(&server).save(&next, Some(1)).await.unwrap_err();
        assert!(err.is_concurrent_modification());
    }

    #[tokio::test]
    async fn test_renew_requires_same_lock() {
        let server = MockServer::start().await;
        let held = LockInfo::new("blog", "me");

        Mock::given(method("GET"))
            .and(path(LOCK_PATH))
            .respond_with(json_object(serde_json::to_string(&held).unwrap(), "\"l1\""))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(LOCK_PATH))
            .and(header("if-match", "\"l1\""))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"l3\""))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        let renewed = store.renew_lock("blog", &held.lock_id).await.unwrap();
        assert!(renewed.expires_at >= held.expires_at);

        let err = store.renew_lock("blog", "someone-else").await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::LockFailed { .. })));
    }
}
