use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// How the upload path finds an existing file with the same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupLookup {
    /// Re-hash every stored image in id order. Slow, but the first matching
    /// record always wins.
    Scan,
    /// Look up the `content_hash` column first and only re-hash rows that
    /// were stored before the column existed.
    Index,
}

impl FromStr for DedupLookup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scan" => Ok(Self::Scan),
            "index" => Ok(Self::Index),
            other => Err(format!("unknown dedup lookup mode '{}'", other)),
        }
    }
}

impl fmt::Display for DedupLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => f.write_str("scan"),
            Self::Index => f.write_str("index"),
        }
    }
}

/// Application configuration, built once at startup and handed to every
/// service that needs it.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database connection string (default: "sqlite://flattop.db?mode=rwc")
    pub database_url: String,

    /// Root directory that all stored paths are relative to (default: "media")
    pub media_root: PathBuf,

    /// Public URL prefix for stored files (default: "/media/")
    pub media_url: String,

    /// Subdirectory of the media root holding card images (default: "card_images")
    pub image_dir: String,

    /// Serve the media root over HTTP (default: true)
    pub serve_media: bool,

    /// Maximum upload size in bytes (default: 32 MB)
    pub max_file_size: usize,

    /// Read size used while hashing (default: 8 KB)
    pub chunk_size: usize,

    /// Duplicate lookup mode for uploads (default: index)
    pub dedup_lookup: DedupLookup,

    /// JWT Secret Key
    pub jwt_secret: String,

    /// Where unauthenticated page views are sent (default: "/accounts/login/")
    pub login_url: String,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://flattop.db?mode=rwc".to_string(),
            media_root: PathBuf::from("media"),
            media_url: "/media/".to_string(),
            image_dir: "card_images".to_string(),
            serve_media: true,
            max_file_size: 32 * 1024 * 1024, // 32 MB
            chunk_size: 8192,
            dedup_lookup: DedupLookup::Index,
            jwt_secret: "secret".to_string(),
            login_url: "/accounts/login/".to_string(),
            allowed_origins: vec![
                "http://localhost:8000".to_string(),
                "http://127.0.0.1:8000".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or(default.database_url),

            media_root: env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.media_root),

            media_url: env::var("MEDIA_URL")
                .map(|v| normalize_media_url(&v))
                .unwrap_or(default.media_url),

            image_dir: env::var("CARD_IMAGE_DIR")
                .map(|v| v.trim_matches('/').to_string())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.image_dir),

            serve_media: env::var("SERVE_MEDIA")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.serve_media),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default.chunk_size),

            dedup_lookup: env::var("DEDUP_LOOKUP")
                .ok()
                .and_then(|v| match v.parse::<DedupLookup>() {
                    Ok(mode) => Some(mode),
                    Err(e) => {
                        tracing::warn!("Ignoring DEDUP_LOOKUP: {}", e);
                        None
                    }
                })
                .unwrap_or(default.dedup_lookup),

            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret),

            login_url: env::var("LOGIN_URL").unwrap_or(default.login_url),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Config for tests and local hacking: in-memory database, parity scan
    pub fn development() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            dedup_lookup: DedupLookup::Scan,
            ..Self::default()
        }
    }
}

fn normalize_media_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}
