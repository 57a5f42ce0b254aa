//! Distributed lease lock
//!
//! Grants one connection exclusive access to an export across any number of
//! server processes. All state lives in a single JSON object per export at
//! `locks/{export_name}/lock.json`; every transition goes through an ETag CAS
//! on that object, so two racing acquirers can never both win.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::client::ClientManager;
use super::{object_store_error, StorageError, StorageResult};

/// Default lease duration; renewal runs at half of it.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

const MAX_RENEWAL_FAILURES: u32 = 3;
const RENEWAL_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Lease lifecycle. `Lost` is terminal for a lock instance; callers must
/// treat it as a fatal storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Inactive,
    Active,
    Lost,
}

/// Lock record stored in the object store. `expires_at` is authoritative for
/// expiry; `timestamp` is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub server_id: String,
    pub connection_id: String,
    pub hostname: String,
    pub pid: u32,
    pub timestamp: f64,
    pub expires_at: f64,
}

impl LockRecord {
    fn new(server_id: &str, connection_id: &str, lease_duration: Duration) -> Self {
        let now = unix_now();
        Self {
            server_id: server_id.to_string(),
            connection_id: connection_id.to_string(),
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            timestamp: now,
            expires_at: now + lease_duration.as_secs_f64(),
        }
    }

    fn is_expired(&self, now: f64) -> bool {
        now > self.expires_at
    }

    fn owned_by(&self, server_id: &str, connection_id: &str) -> bool {
        self.server_id == server_id && self.connection_id == connection_id
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

enum PutCondition<'a> {
    IfNoneMatch,
    IfMatch(&'a str),
}

fn is_precondition_failure<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.code(),
        Some("PreconditionFailed") | Some("ConditionalRequestConflict")
    )
}

/// Distributed lease-based lock for one export.
pub struct LeaseLock {
    export_name: String,
    server_id: String,
    connection_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
    s3: Arc<ClientManager>,
    state: Arc<Mutex<LeaseState>>,
    cancel: Arc<Notify>,
    renew_task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseLock {
    pub fn new(
        export_name: &str,
        s3: Arc<ClientManager>,
        server_id: &str,
        connection_id: &str,
        lease_duration: Duration,
    ) -> Self {
        Self {
            export_name: export_name.to_string(),
            server_id: server_id.to_string(),
            connection_id: connection_id.to_string(),
            lease_duration,
            renew_interval: lease_duration / 2,
            s3,
            state: Arc::new(Mutex::new(LeaseState::Inactive)),
            cancel: Arc::new(Notify::new()),
            renew_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LeaseState {
        *self.state.lock().unwrap()
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    fn lock_key(&self) -> String {
        format!("locks/{}/lock.json", self.export_name)
    }

    /// Acquire exclusive access to the export. Returns `false` when the
    /// export is held by a live lease or when a racing acquirer got there
    /// first.
    pub async fn acquire(&self) -> StorageResult<bool> {
        if self.state() == LeaseState::Active {
            log::debug!("Lease already active for '{}'", self.export_name);
            return Ok(true);
        }

        let key = self.lock_key();
        let record = LockRecord::new(&self.server_id, &self.connection_id, self.lease_duration);

        let acquired = match Self::fetch(&self.s3, &key).await? {
            None => {
                if Self::put_record(&self.s3, &key, &record, PutCondition::IfNoneMatch).await? {
                    log::info!(
                        "Acquired lease for '{}' (server={}, connection={})",
                        self.export_name,
                        self.server_id,
                        self.connection_id
                    );
                    true
                } else {
                    log::warn!("Lost race creating lease for '{}'", self.export_name);
                    false
                }
            }
            Some((existing, etag)) => {
                if existing.owned_by(&self.server_id, &self.connection_id) {
                    // Our own record from an earlier acquire; renew in place.
                    if Self::put_record(&self.s3, &key, &record, PutCondition::IfMatch(&etag))
                        .await?
                    {
                        log::info!("Re-acquired own lease for '{}'", self.export_name);
                        true
                    } else {
                        log::warn!("Lost race renewing own lease for '{}'", self.export_name);
                        false
                    }
                } else if existing.is_expired(unix_now()) {
                    if Self::put_record(&self.s3, &key, &record, PutCondition::IfMatch(&etag))
                        .await?
                    {
                        log::info!(
                            "Took over expired lease for '{}' (previous holder: server={}, connection={})",
                            self.export_name,
                            existing.server_id,
                            existing.connection_id
                        );
                        true
                    } else {
                        log::warn!(
                            "Lost race taking over expired lease for '{}'",
                            self.export_name
                        );
                        false
                    }
                } else {
                    log::warn!(
                        "Export '{}' is leased to server={}, connection={} (expires in {:.1}s)",
                        self.export_name,
                        existing.server_id,
                        existing.connection_id,
                        existing.expires_at - unix_now()
                    );
                    false
                }
            }
        };

        if acquired {
            *self.state.lock().unwrap() = LeaseState::Active;
            self.spawn_renewal();
        }
        Ok(acquired)
    }

    /// Release the lease: stop renewal, then delete the lock object if this
    /// instance is still the recorded owner. Best-effort; a record that has
    /// already moved on is left alone.
    pub async fn release(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = *state;
            *state = LeaseState::Inactive;
            previous
        };

        self.cancel.notify_one();
        let task = self.renew_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if previous == LeaseState::Inactive {
            return;
        }

        let key = self.lock_key();
        match Self::fetch(&self.s3, &key).await {
            Ok(Some((record, etag)))
                if record.owned_by(&self.server_id, &self.connection_id) =>
            {
                let result = self
                    .s3
                    .client()
                    .delete_object()
                    .bucket(self.s3.bucket())
                    .key(&key)
                    .if_match(&etag)
                    .send()
                    .await;
                match result {
                    Ok(_) => log::info!(
                        "Released lease for '{}' (server={}, connection={})",
                        self.export_name,
                        self.server_id,
                        self.connection_id
                    ),
                    Err(err) if is_precondition_failure(&err) => log::debug!(
                        "Lease for '{}' changed hands during release",
                        self.export_name
                    ),
                    Err(err) => log::warn!(
                        "Error deleting lease for '{}': {}",
                        self.export_name,
                        object_store_error(err)
                    ),
                }
            }
            Ok(_) => log::debug!(
                "Lease for '{}' already taken over, nothing to delete",
                self.export_name
            ),
            Err(err) => log::warn!(
                "Error checking lease for '{}' during release: {}",
                self.export_name,
                err
            ),
        }
    }

    fn spawn_renewal(&self) {
        let export_name = self.export_name.clone();
        let server_id = self.server_id.clone();
        let connection_id = self.connection_id.clone();
        let lease_duration = self.lease_duration;
        let renew_interval = self.renew_interval;
        let key = self.lock_key();
        let s3 = Arc::clone(&self.s3);
        let state = Arc::clone(&self.state);
        let cancel = Arc::clone(&self.cancel);

        let task = tokio::spawn(async move {
            log::info!(
                "Started lease renewal for '{}' (interval={:.1}s, lease={}s)",
                export_name,
                renew_interval.as_secs_f64(),
                lease_duration.as_secs()
            );

            let mut failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.notified() => {
                        log::debug!("Lease renewal cancelled for '{}'", export_name);
                        return;
                    }
                    _ = tokio::time::sleep(renew_interval) => {}
                }

                if *state.lock().unwrap() != LeaseState::Active {
                    return;
                }

                match Self::renew_once(&s3, &key, &server_id, &connection_id, lease_duration).await
                {
                    Ok(true) => {
                        failures = 0;
                        log::debug!("Renewed lease for '{}'", export_name);
                    }
                    Ok(false) => {
                        log::error!(
                            "Lease for '{}' is owned elsewhere, marking lost",
                            export_name
                        );
                        *state.lock().unwrap() = LeaseState::Lost;
                        return;
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= MAX_RENEWAL_FAILURES {
                            log::error!(
                                "Lease renewal for '{}' failed {} times, marking lost: {}",
                                export_name,
                                failures,
                                err
                            );
                            *state.lock().unwrap() = LeaseState::Lost;
                            return;
                        }

                        let backoff =
                            Duration::from_secs(1 << (failures - 1)).min(RENEWAL_BACKOFF_CAP);
                        log::warn!(
                            "Lease renewal for '{}' failed (attempt {}/{}): {}. Retrying in {}s",
                            export_name,
                            failures,
                            MAX_RENEWAL_FAILURES,
                            err,
                            backoff.as_secs()
                        );
                        tokio::select! {
                            _ = cancel.notified() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        });

        *self.renew_task.lock().unwrap() = Some(task);
    }

    /// One renewal cycle: re-read the record, verify ownership, and push a
    /// fresh record through the ETag CAS. `Ok(false)` means ownership moved.
    async fn renew_once(
        s3: &ClientManager,
        key: &str,
        server_id: &str,
        connection_id: &str,
        lease_duration: Duration,
    ) -> StorageResult<bool> {
        match Self::fetch(s3, key).await? {
            Some((record, etag)) if record.owned_by(server_id, connection_id) => {
                let fresh = LockRecord::new(server_id, connection_id, lease_duration);
                Self::put_record(s3, key, &fresh, PutCondition::IfMatch(&etag)).await
            }
            _ => Ok(false),
        }
    }

    /// Fetch the current record and its ETag, or `None` when no lock exists.
    async fn fetch(
        s3: &ClientManager,
        key: &str,
    ) -> StorageResult<Option<(LockRecord, String)>> {
        match s3
            .client()
            .get_object()
            .bucket(s3.bucket())
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let etag = output
                    .e_tag()
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_string();
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::ObjectStore(e.to_string()))?;
                let record: LockRecord = serde_json::from_slice(&body.to_vec())
                    .map_err(|e| StorageError::ObjectStore(format!("invalid lock record: {}", e)))?;
                Ok(Some((record, etag)))
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(err) => Err(object_store_error(err)),
        }
    }

    /// Conditionally write a record. `Ok(false)` means the precondition
    /// failed, i.e. the CAS was lost to another party.
    async fn put_record(
        s3: &ClientManager,
        key: &str,
        record: &LockRecord,
        condition: PutCondition<'_>,
    ) -> StorageResult<bool> {
        let body = serde_json::to_vec(record)
            .map_err(|e| StorageError::ObjectStore(format!("cannot encode lock record: {}", e)))?;

        let request = s3
            .client()
            .put_object()
            .bucket(s3.bucket())
            .key(key)
            .body(ByteStream::from(body));
        let request = match condition {
            PutCondition::IfNoneMatch => request.if_none_match("*"),
            PutCondition::IfMatch(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if is_precondition_failure(&err) => Ok(false),
            Err(err) => Err(object_store_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3Config;
    use uuid::Uuid;

    #[test]
    fn test_record_fields_round_trip() {
        let record = LockRecord::new("srv", "conn", Duration::from_secs(30));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["server_id"], "srv");
        assert_eq!(json["connection_id"], "conn");
        assert!(json["hostname"].is_string());
        assert!(json["pid"].is_u64());
        assert!(json["timestamp"].is_f64());
        assert!(json["expires_at"].is_f64());

        let parsed: LockRecord = serde_json::from_value(json).unwrap();
        assert!(parsed.owned_by("srv", "conn"));
    }

    #[test]
    fn test_record_expiry() {
        let record = LockRecord::new("srv", "conn", Duration::from_secs(30));
        assert!(!record.is_expired(record.timestamp));
        assert!(!record.is_expired(record.expires_at));
        assert!(record.is_expired(record.expires_at + 0.1));
    }

    #[test]
    fn test_record_ownership() {
        let record = LockRecord::new("srv", "conn", Duration::from_secs(30));
        assert!(record.owned_by("srv", "conn"));
        assert!(!record.owned_by("srv", "other"));
        assert!(!record.owned_by("other", "conn"));
    }

    #[test]
    fn test_record_renewal_moves_expiry() {
        let old = LockRecord::new("srv", "conn", Duration::from_secs(2));
        let renewed = LockRecord::new("srv", "conn", Duration::from_secs(30));
        assert!(renewed.expires_at > old.expires_at);
        assert!(renewed.timestamp >= old.timestamp);
    }

    // The tests below need a running S3-compatible store (e.g. MinIO with
    // the default credentials) on 127.0.0.1:9000.

    fn test_client() -> Arc<ClientManager> {
        Arc::new(ClientManager::new(&S3Config {
            endpoint_url: "http://127.0.0.1:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "s3nbd-test".to_string(),
            region: "us-east-1".to_string(),
        }))
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_acquire_release() {
        let s3 = test_client();
        s3.ensure_bucket().await.unwrap();
        let export = format!("lock-test-{}", Uuid::new_v4());

        let lock = LeaseLock::new(&export, Arc::clone(&s3), "srv-a", "conn-1", Duration::from_secs(30));
        assert!(lock.acquire().await.unwrap());
        assert_eq!(lock.state(), LeaseState::Active);

        lock.release().await;
        assert_eq!(lock.state(), LeaseState::Inactive);

        // released lock can be taken by someone else
        let other = LeaseLock::new(&export, s3, "srv-b", "conn-2", Duration::from_secs(30));
        assert!(other.acquire().await.unwrap());
        other.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_contention() {
        let s3 = test_client();
        s3.ensure_bucket().await.unwrap();
        let export = format!("lock-test-{}", Uuid::new_v4());

        let holder = LeaseLock::new(&export, Arc::clone(&s3), "srv-a", "conn-1", Duration::from_secs(30));
        assert!(holder.acquire().await.unwrap());

        let contender = LeaseLock::new(&export, Arc::clone(&s3), "srv-b", "conn-2", Duration::from_secs(30));
        assert!(!contender.acquire().await.unwrap());

        holder.release().await;
        assert!(contender.acquire().await.unwrap());
        contender.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_expired_takeover() {
        let s3 = test_client();
        s3.ensure_bucket().await.unwrap();
        let export = format!("lock-test-{}", Uuid::new_v4());

        // Short lease whose renewal is stopped immediately, so it expires.
        let holder = LeaseLock::new(&export, Arc::clone(&s3), "srv-a", "conn-1", Duration::from_secs(2));
        assert!(holder.acquire().await.unwrap());
        holder.cancel.notify_one();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let taker = LeaseLock::new(&export, Arc::clone(&s3), "srv-b", "conn-2", Duration::from_secs(30));
        assert!(taker.acquire().await.unwrap());

        let (record, _) = LeaseLock::fetch(&s3, &taker.lock_key()).await.unwrap().unwrap();
        assert_eq!(record.connection_id, "conn-2");
        taker.release().await;
    }
}
