use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::transcoder::DEFAULT_MAX_DIMENSION;

/// S3 rejects multipart parts smaller than this (except the last one).
pub const MIN_MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_BIND_ADDR: &str = "localhost:5555";
const DEFAULT_ADMIN_PATH: &str = "admin";
const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
// Smallest part S3 accepts, so a file reports progress every 5 MiB.
const DEFAULT_PART_SIZE: usize = MIN_MULTIPART_PART_SIZE;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_ATTESTATION_TTL_SECS: u64 = 3600;

/// Runtime configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    /// Base URL used when building download locators, without trailing slash.
    pub public_base_url: String,
    /// Path segment the admin views are mounted under.
    pub admin_path: String,
    /// Postgres connection string. In-memory documents when unset.
    pub database_url: Option<String>,
    /// S3 bucket for media blobs. In-memory blobs when unset.
    pub s3_bucket: Option<String>,
    /// Custom S3 endpoint for non-AWS providers. Path-style addressing is used when set.
    pub s3_endpoint: Option<String>,
    /// Static credentials. The default AWS provider chain is used when unset.
    pub s3_credentials: Option<(String, String)>,
    pub s3_region: String,
    pub s3_max_concurrency: usize,
    pub s3_max_rps: u32,
    pub attestation_secret: Vec<u8>,
    pub attestation_ttl: Duration,
    pub preview_max_dimension: u32,
    pub upload_concurrency: usize,
    pub multipart_part_size: usize,
    pub max_upload_bytes: usize,
    pub ffmpeg_path: String,
    pub sentry_dsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{key} must be set"),
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "{key}={value:?} is invalid: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let attestation_secret = get("ATTESTATION_SECRET")
            .ok_or(ConfigError::Missing("ATTESTATION_SECRET"))?
            .into_bytes();
        if attestation_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                key: "ATTESTATION_SECRET",
                value: "<redacted>".to_string(),
                reason: "must be at least 32 bytes".to_string(),
            });
        }

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{bind_addr}"))
            .trim_end_matches('/')
            .to_string();

        let admin_path = get("ADMIN_PATH")
            .unwrap_or_else(|| DEFAULT_ADMIN_PATH.to_string())
            .trim_matches('/')
            .to_string();
        if admin_path.is_empty() || admin_path.contains('/') {
            return Err(ConfigError::Invalid {
                key: "ADMIN_PATH",
                value: admin_path,
                reason: "must be a single non-empty path segment".to_string(),
            });
        }

        let multipart_part_size = parse_or(&get, "MULTIPART_PART_SIZE", DEFAULT_PART_SIZE)?;
        if multipart_part_size < MIN_MULTIPART_PART_SIZE {
            return Err(ConfigError::Invalid {
                key: "MULTIPART_PART_SIZE",
                value: multipart_part_size.to_string(),
                reason: format!("must be at least {MIN_MULTIPART_PART_SIZE} bytes"),
            });
        }

        let preview_max_dimension =
            parse_or(&get, "PREVIEW_MAX_DIMENSION", DEFAULT_MAX_DIMENSION)?;
        if preview_max_dimension == 0 {
            return Err(ConfigError::Invalid {
                key: "PREVIEW_MAX_DIMENSION",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            public_base_url,
            admin_path,
            database_url: get("DATABASE_URL"),
            s3_bucket: get("S3_BUCKET_NAME"),
            s3_endpoint: get("S3_DOMAIN"),
            s3_credentials: get("S3_ACCESS_KEY_ID").zip(get("S3_SECRET_ACCESS_KEY")),
            s3_region: get("S3_REGION").unwrap_or_else(|| "eu-central-1".to_string()),
            s3_max_concurrency: parse_or(&get, "S3_MAX_CONCURRENCY", 16)?,
            s3_max_rps: parse_or(&get, "S3_MAX_RPS", 50)?,
            attestation_secret,
            attestation_ttl: Duration::from_secs(parse_or(
                &get,
                "ATTESTATION_TTL_SECS",
                DEFAULT_ATTESTATION_TTL_SECS,
            )?),
            preview_max_dimension,
            upload_concurrency: parse_or(&get, "UPLOAD_CONCURRENCY", DEFAULT_UPLOAD_CONCURRENCY)?
                .max(1),
            multipart_part_size,
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            sentry_dsn: get("SENTRY_DSN"),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "ATTESTATION_SECRET" => Some("0123456789abcdef0123456789abcdef".to_string()),
        "PUBLIC_BASE_URL" => Some("http://gallery.test/".to_string()),
        _ => None,
    })
    .expect("test config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = Config::from_lookup(lookup(&[("ATTESTATION_SECRET", SECRET)])).unwrap();
        assert_eq!(config.bind_addr, "localhost:5555");
        assert_eq!(config.public_base_url, "http://localhost:5555");
        assert_eq!(config.admin_path, "admin");
        assert_eq!(config.preview_max_dimension, 720);
        assert_eq!(config.multipart_part_size, MIN_MULTIPART_PART_SIZE);
        assert!(config.database_url.is_none());
        assert!(config.s3_bucket.is_none());
    }

    #[test]
    fn missing_secret_is_rejected() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("ATTESTATION_SECRET"));
    }

    #[test]
    fn short_secret_is_rejected() {
        let err = Config::from_lookup(lookup(&[("ATTESTATION_SECRET", "short")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ATTESTATION_SECRET", .. }));
    }

    #[test]
    fn unparsable_number_names_the_key() {
        let err = Config::from_lookup(lookup(&[
            ("ATTESTATION_SECRET", SECRET),
            ("UPLOAD_CONCURRENCY", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "UPLOAD_CONCURRENCY", .. }));
    }

    #[test]
    fn admin_path_is_trimmed_and_must_be_one_segment() {
        let config = Config::from_lookup(lookup(&[
            ("ATTESTATION_SECRET", SECRET),
            ("ADMIN_PATH", "/secret-room/"),
        ]))
        .unwrap();
        assert_eq!(config.admin_path, "secret-room");

        let err = Config::from_lookup(lookup(&[
            ("ATTESTATION_SECRET", SECRET),
            ("ADMIN_PATH", "a/b"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ADMIN_PATH", .. }));
    }

    #[test]
    fn part_size_below_s3_minimum_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("ATTESTATION_SECRET", SECRET),
            ("MULTIPART_PART_SIZE", "1024"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MULTIPART_PART_SIZE", .. }));
    }
}
