use crate::services::caption_service::{DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GeminiConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_endpoint: String,
    pub caption_timeout: Duration,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Photo upload service with AI captions")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where photos and captions are stored (overrides PHOTO_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Gemini API key (overrides GEMINI_API)
    #[arg(long)]
    pub gemini_api_key: Option<String>,

    /// Gemini model name (overrides PHOTO_STORE_GEMINI_MODEL)
    #[arg(long)]
    pub gemini_model: Option<String>,

    /// Gemini REST endpoint (overrides PHOTO_STORE_GEMINI_ENDPOINT)
    #[arg(long)]
    pub gemini_endpoint: Option<String>,

    /// Seconds to wait for a caption before using the fallback
    /// (overrides PHOTO_STORE_CAPTION_TIMEOUT_SECS)
    #[arg(long)]
    pub caption_timeout_secs: Option<u64>,

    /// Largest accepted upload body in bytes (overrides PHOTO_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse `key`, returning `None` when it is unset.
fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Merge parsed CLI args over environment values over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let env_host = env_string("PHOTO_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parsed::<u16>("PHOTO_STORE_PORT")?.unwrap_or(8080);
        let env_storage =
            env_string("PHOTO_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/blobs".into());
        let env_db = env_string("PHOTO_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/photos.db".into());
        let env_model =
            env_string("PHOTO_STORE_GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into());
        let env_endpoint = env_string("PHOTO_STORE_GEMINI_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.into());
        let env_timeout = env_parsed::<u64>("PHOTO_STORE_CAPTION_TIMEOUT_SECS")?.unwrap_or(30);
        let env_max_upload = env_parsed::<usize>("PHOTO_STORE_MAX_UPLOAD_BYTES")?
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            gemini_api_key: args.gemini_api_key.or_else(|| env_string("GEMINI_API")),
            gemini_model: args.gemini_model.unwrap_or(env_model),
            gemini_endpoint: args.gemini_endpoint.unwrap_or(env_endpoint),
            caption_timeout: Duration::from_secs(args.caption_timeout_secs.unwrap_or(env_timeout)),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone(),
            model: self.gemini_model.clone(),
            endpoint: self.gemini_endpoint.clone(),
            request_timeout: self.caption_timeout,
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field(
                "gemini_api_key",
                &self.gemini_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("gemini_model", &self.gemini_model)
            .field("gemini_endpoint", &self.gemini_endpoint)
            .field("caption_timeout", &self.caption_timeout)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_override_everything() {
        let cfg = AppConfig::merge(Args {
            host: Some("127.0.0.1".into()),
            port: Some(9999),
            storage_dir: Some("/tmp/blobs".into()),
            database_url: Some("sqlite::memory:".into()),
            gemini_api_key: Some("key".into()),
            gemini_model: Some("gemini-test".into()),
            gemini_endpoint: Some("http://localhost:1/v1beta".into()),
            caption_timeout_secs: Some(3),
            max_upload_bytes: Some(1024),
            migrate: false,
        })
        .unwrap();

        assert_eq!(cfg.addr(), "127.0.0.1:9999");
        assert_eq!(cfg.storage_dir, "/tmp/blobs");
        assert_eq!(cfg.max_upload_bytes, 1024);

        let gemini = cfg.gemini();
        assert_eq!(gemini.api_key.as_deref(), Some("key"));
        assert_eq!(gemini.model, "gemini-test");
        assert_eq!(gemini.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let cfg = AppConfig::merge(Args {
            gemini_api_key: Some("super-secret".into()),
            ..Args::default()
        })
        .unwrap();
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn cli_parses_flags() {
        let args = Args::try_parse_from([
            "photo-caption-store",
            "--port",
            "4000",
            "--caption-timeout-secs",
            "5",
            "--migrate",
        ])
        .unwrap();
        assert_eq!(args.port, Some(4000));
        assert_eq!(args.caption_timeout_secs, Some(5));
        assert!(args.migrate);
    }
}
