//! Shared object-store client
//!
//! One long-lived S3 client per process. Both the block store and the lease
//! lock issue their calls through it, so retry policy, timeouts, and the
//! connection pool are configured in a single place.

use std::time::Duration;

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::Client;

use super::{object_store_error, StorageResult};
use crate::config::S3Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 5;

/// Shared S3 client with adaptive retry and fixed timeouts.
#[derive(Debug, Clone)]
pub struct ClientManager {
    client: Client,
    bucket: String,
}

impl ClientManager {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "s3nbd-static",
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build();

        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .retry_config(RetryConfig::adaptive().with_max_attempts(MAX_ATTEMPTS))
            .timeout_config(timeouts)
            .force_path_style(true)
            .build();

        log::debug!(
            "S3 client initialized: endpoint={}, region={}, bucket={}, retry=adaptive({}), timeout={}s/{}s",
            config.endpoint_url,
            config.region,
            config.bucket,
            MAX_ATTEMPTS,
            CONNECT_TIMEOUT.as_secs(),
            READ_TIMEOUT.as_secs()
        );

        Self {
            client: Client::from_conf(conf),
            bucket: config.bucket.clone(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                log::debug!("Bucket '{}' exists", self.bucket);
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                log::info!("Creating bucket '{}'", self.bucket);
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(object_store_error)?;
                Ok(())
            }
            Err(err) => Err(object_store_error(err)),
        }
    }
}
