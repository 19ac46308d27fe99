use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::Subscriber;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// How the cache should set up tracing when the host asks it to. Most
/// embedders bring their own subscriber and never touch this.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Filter applied when `RUST_LOG` is not set.
    pub fallback_directive: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            fallback_directive: "restash=info".to_string(),
        }
    }
}

/// Installs a global tracing subscriber. Fails if one is already set.
pub fn init_logger(options: &LogOptions) -> Result<()> {
    let builder = Subscriber::builder().with_env_filter(resolve_filter(options));
    let installed = match options.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.with_target(false).try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn resolve_filter(options: &LogOptions) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ => EnvFilter::new(&options.fallback_directive),
    }
}
