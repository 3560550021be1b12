//! Service configuration.
//!
//! Everything is read once at startup from `CXR_*` environment variables.
//! Missing keys fall back to defaults; malformed values abort startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::pipeline::attribution::QuadratureRule;
use crate::pipeline::overlay::ColorMap;

/// Application-level constants
pub const APP_NAME: &str = "CxrLens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Spatial size (pixels per side) of the network input.
pub const INPUT_SIZE: usize = 224;

/// Name of the pretrained weights the default model directory holds.
pub const DEFAULT_WEIGHTS: &str = "densenet121-res224-all";

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_IG_STEPS: usize = 50;
const DEFAULT_IG_BATCH: usize = 8;
const DEFAULT_MAX_UPLOAD_MB: usize = 50;
const DEFAULT_INTRA_THREADS: usize = 2;

/// Default tracing filter when neither `RUST_LOG` nor `CXR_LOG` is set.
pub fn default_log_filter() -> String {
    std::env::var("CXR_LOG").unwrap_or_else(|_| "cxr_lens=info,tower_http=info".to_string())
}

/// Get the application data directory (`~/CxrLens/`).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the models directory
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Default directory of the pretrained DenseNet export.
pub fn default_model_dir() -> PathBuf {
    models_dir().join(DEFAULT_WEIGHTS)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration for the whole service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub model_dir: PathBuf,
    pub ig_steps: usize,
    pub ig_method: QuadratureRule,
    pub ig_batch: usize,
    pub colormap: ColorMap,
    pub max_upload_bytes: usize,
    pub intra_threads: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            model_dir: default_model_dir(),
            ig_steps: DEFAULT_IG_STEPS,
            ig_method: QuadratureRule::GaussLegendre,
            ig_batch: DEFAULT_IG_BATCH,
            colormap: ColorMap::Bwr,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    /// Split out from `from_env` so tests don't touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = match lookup("CXR_BIND_ADDR") {
            Some(raw) => parse_value("CXR_BIND_ADDR", &raw)?,
            None => defaults.bind_addr,
        };

        let model_dir = lookup("CXR_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let ig_steps = positive("CXR_IG_STEPS", lookup("CXR_IG_STEPS"), defaults.ig_steps)?;
        let ig_batch = positive("CXR_IG_BATCH", lookup("CXR_IG_BATCH"), defaults.ig_batch)?;
        let intra_threads = positive(
            "CXR_INTRA_THREADS",
            lookup("CXR_INTRA_THREADS"),
            defaults.intra_threads,
        )?;
        let max_upload_mb = positive(
            "CXR_MAX_UPLOAD_MB",
            lookup("CXR_MAX_UPLOAD_MB"),
            DEFAULT_MAX_UPLOAD_MB,
        )?;
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| ConfigError::Invalid {
                key: "CXR_MAX_UPLOAD_MB",
                value: max_upload_mb.to_string(),
                reason: "too large to express in bytes".into(),
            })?;

        let ig_method = match lookup("CXR_IG_METHOD") {
            Some(raw) => parse_value("CXR_IG_METHOD", &raw)?,
            None => defaults.ig_method,
        };

        // Trapezoid needs both endpoints.
        if ig_method == QuadratureRule::RiemannTrapezoid && ig_steps < 2 {
            return Err(ConfigError::Invalid {
                key: "CXR_IG_STEPS",
                value: ig_steps.to_string(),
                reason: "riemann_trapezoid requires at least 2 steps".into(),
            });
        }

        let colormap = match lookup("CXR_COLORMAP") {
            Some(raw) => parse_value("CXR_COLORMAP", &raw)?,
            None => defaults.colormap,
        };

        Ok(Self {
            bind_addr,
            model_dir,
            ig_steps,
            ig_method,
            ig_batch,
            colormap,
            max_upload_bytes,
            intra_threads,
        })
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive(key: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: usize = parse_value(key, &raw)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
