//! Server configuration
//!
//! Listener and object-store settings shared by every export served by one
//! process.

use std::time::Duration;
use thiserror::Error;

/// Default listen address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default NBD port
pub const DEFAULT_PORT: u16 = 10809;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Object store connection settings
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL (e.g. `http://127.0.0.1:9000`)
    pub endpoint_url: String,

    /// Access key
    pub access_key: String,

    /// Secret key
    pub secret_key: String,

    /// Bucket holding block and lock objects
    pub bucket: String,

    /// Region name
    pub region: String,
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Size of every export in bytes
    pub export_size: u64,

    /// Block size in bytes
    pub block_size: u64,

    /// Lease duration for the per-export lock
    pub lease_duration: Duration,

    /// Object store settings
    pub s3: S3Config,
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block size must be non-zero".to_string()));
        }
        if self.export_size == 0 {
            return Err(ConfigError::Invalid("export size must be non-zero".to_string()));
        }
        if self.export_size % self.block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "export size {} is not a multiple of block size {}",
                self.export_size, self.block_size
            )));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease duration must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse a size given as plain bytes or with a K/M/G/T suffix (powers of 1024).
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let s = input.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let mult: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(ConfigError::InvalidSize(input.to_string())),
            };
            (s[..s.len() - 1].trim_end(), mult)
        }
        Some(_) => (s, 1),
        None => return Err(ConfigError::InvalidSize(input.to_string())),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(export_size: u64, block_size: u64) -> ServerConfig {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            export_size,
            block_size,
            lease_duration: Duration::from_secs(30),
            s3: S3Config {
                endpoint_url: "http://127.0.0.1:9000".to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                bucket: "nbd".to_string(),
                region: "us-east-1".to_string(),
            },
        }
    }

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("128K").unwrap(), 128 * 1024);
        assert_eq!(parse_size("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2T").unwrap(), 2 * (1u64 << 40));
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(matches!(parse_size(""), Err(ConfigError::InvalidSize(_))));
        assert!(matches!(parse_size("12Q"), Err(ConfigError::InvalidSize(_))));
        assert!(matches!(parse_size("G"), Err(ConfigError::InvalidSize(_))));
        assert!(matches!(parse_size("abc"), Err(ConfigError::InvalidSize(_))));
    }

    #[test]
    fn test_parse_size_overflow() {
        assert!(matches!(
            parse_size("99999999999999999999T"),
            Err(ConfigError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_validate_ok() {
        assert!(config(1 << 30, 128 * 1024).validate().is_ok());
    }

    #[test]
    fn test_validate_zero_block_size() {
        assert!(matches!(
            config(1 << 30, 0).validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_unaligned_export_size() {
        assert!(matches!(
            config(100, 64).validate(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
