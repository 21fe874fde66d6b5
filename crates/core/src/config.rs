// Runtime configuration (environment driven, with defaults)

use crate::error::{AppError, Result};

pub const DEFAULT_DB_PATH: &str = "~/.tessera/cache.db";
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

pub const ENV_DB_PATH: &str = "TESSERA_DB_PATH";
pub const ENV_WORKER_THREADS: &str = "TESSERA_WORKER_THREADS";
pub const ENV_TILE_SIZE: &str = "TESSERA_TILE_SIZE";
pub const ENV_JPEG_QUALITY: &str = "TESSERA_JPEG_QUALITY";

/// Settings shared by the store, the worker pool and the generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// SQLite path or URL (tilde already expanded)
    pub db_path: String,
    pub worker_threads: usize,
    /// Edge length of a square tile in pixels
    pub tile_size: u32,
    pub jpeg_quality: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: shellexpand::tilde(DEFAULT_DB_PATH).into_owned(),
            worker_threads: DEFAULT_WORKER_THREADS,
            tile_size: DEFAULT_TILE_SIZE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl CacheConfig {
    /// Load configuration from `TESSERA_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup(ENV_DB_PATH)
            .map(|p| shellexpand::tilde(&p).into_owned())
            .unwrap_or(defaults.db_path);

        let worker_threads = parse_or(&lookup, ENV_WORKER_THREADS, defaults.worker_threads)?;
        if worker_threads == 0 {
            return Err(AppError::Config(format!("{} must be at least 1", ENV_WORKER_THREADS)));
        }

        let tile_size = parse_or(&lookup, ENV_TILE_SIZE, defaults.tile_size)?;
        if tile_size == 0 {
            return Err(AppError::Config(format!("{} must be at least 1", ENV_TILE_SIZE)));
        }

        let jpeg_quality = parse_or(&lookup, ENV_JPEG_QUALITY, defaults.jpeg_quality)?;
        if !(1..=100).contains(&jpeg_quality) {
            return Err(AppError::Config(format!(
                "{} must be within 1..=100, got {}",
                ENV_JPEG_QUALITY, jpeg_quality
            )));
        }

        Ok(Self {
            db_path,
            worker_threads,
            tile_size,
            jpeg_quality,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has invalid value '{}'", key, raw))),
    }
}
