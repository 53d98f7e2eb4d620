//! Configuration types.
//!
//! Everything is read from `DISPATCH_*` environment variables with defaults;
//! `from_lookup` takes the variable source as a function so tests do not
//! touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::FallbackTable;

/// Scheduler and reclaimer tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between loop iterations.
    pub poll_interval: Duration,
    /// Busy agents idle longer than this are reclaimed.
    pub stale_threshold: Duration,
    /// Soft deadline for a whole pipeline run.
    pub pipeline_deadline: Duration,
    /// Reclaim every busy agent at boot.
    pub recover_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(1800), // 30 minutes
            pipeline_deadline: Duration::from_secs(3600), // 1 hour
            recover_on_startup: true,
        }
    }
}

/// Inference endpoint and retry policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    /// Attempts at the requested model before falling back.
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub fallbacks: FallbackTable,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            backoff_base: 2.0,
            fallbacks: FallbackTable::default(),
        }
    }
}

/// Search endpoint.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub search_url: String,
    pub fetch_timeout: Duration,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            search_url: "http://localhost:8888".to_string(),
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

/// Phase pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Search queries run per task.
    pub max_queries: usize,
    pub results_per_query: usize,
    /// Characters of page text kept per result.
    pub excerpt_chars: usize,
    pub plan_tokens: u32,
    pub summary_tokens: u32,
    pub artifact_tokens: u32,
    pub critique_tokens: u32,
    /// Case-insensitive phrases in a critique that trigger a revision.
    pub revision_phrases: Vec<String>,
}

/// Phrases that mark a critique as requiring a revision.
pub const DEFAULT_REVISION_PHRASES: &[&str] = &[
    "major revisions",
    "significant revisions",
    "substantial revisions",
    "needs revision",
    "requires revision",
    "major issues",
    "does not meet",
];

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queries: 8,
            results_per_query: 3,
            excerpt_chars: 2000,
            plan_tokens: 2048,
            summary_tokens: 1024,
            artifact_tokens: 4096,
            critique_tokens: 1536,
            revision_phrases: DEFAULT_REVISION_PHRASES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// An operator-provisioned agent from `DISPATCH_AGENTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub model: String,
    pub min_complexity: i32,
    pub max_complexity: i32,
}

impl FromStr for AgentSpec {
    type Err = String;

    /// Parses `name:model:min:max`. The model may itself contain colons
    /// (`llama3.1:8b`), so the band is taken from the right.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().rsplitn(3, ':');
        let max = parts.next();
        let min = parts.next();
        let head = parts.next();
        let (Some(max), Some(min), Some(head)) = (max, min, head) else {
            return Err(format!("expected name:model:min:max, got '{s}'"));
        };
        let (name, model) = head
            .split_once(':')
            .filter(|(n, m)| !n.is_empty() && !m.is_empty())
            .ok_or_else(|| format!("expected name:model:min:max, got '{s}'"))?;
        let min_complexity: i32 = min
            .trim()
            .parse()
            .map_err(|e| format!("bad min_complexity in '{s}': {e}"))?;
        let max_complexity: i32 = max
            .trim()
            .parse()
            .map_err(|e| format!("bad max_complexity in '{s}': {e}"))?;
        if min_complexity > max_complexity {
            return Err(format!("min_complexity > max_complexity in '{s}'"));
        }
        Ok(Self {
            name: name.trim().to_string(),
            model: model.trim().to_string(),
            min_complexity,
            max_complexity,
        })
    }
}

/// Top-level dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub db_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
    pub research: ResearchConfig,
    pub pipeline: PipelineConfig,
    pub agents: Vec<AgentSpec>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/dispatch.db"),
            workspace_dir: PathBuf::from("./data/artifacts"),
            log_dir: None,
            scheduler: SchedulerConfig::default(),
            gateway: GatewayConfig::default(),
            research: ResearchConfig::default(),
            pipeline: PipelineConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl DispatchConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let sched = &defaults.scheduler;
        let scheduler = SchedulerConfig {
            poll_interval: positive_secs(&get, "DISPATCH_POLL_INTERVAL_SECS", sched.poll_interval)?,
            stale_threshold: secs(&get, "DISPATCH_STALE_THRESHOLD_SECS", sched.stale_threshold)?,
            pipeline_deadline: positive_secs(
                &get,
                "DISPATCH_PIPELINE_DEADLINE_SECS",
                sched.pipeline_deadline,
            )?,
            recover_on_startup: parse_bool(
                &get,
                "DISPATCH_RECOVER_ON_STARTUP",
                sched.recover_on_startup,
            )?,
        };

        let fallbacks = match get("DISPATCH_MODEL_FALLBACKS") {
            Some(spec) => FallbackTable::default()
                .with_overrides(&spec)
                .map_err(|message| invalid("DISPATCH_MODEL_FALLBACKS", message))?,
            None => defaults.gateway.fallbacks,
        };

        let gateway = GatewayConfig {
            base_url: get("DISPATCH_LLM_URL").unwrap_or(defaults.gateway.base_url),
            api_key: get("DISPATCH_LLM_API_KEY").map(SecretString::from),
            timeout: positive_secs(&get, "DISPATCH_LLM_TIMEOUT_SECS", defaults.gateway.timeout)?,
            max_attempts: parse(&get, "DISPATCH_LLM_RETRIES", defaults.gateway.max_attempts)?
                .max(1),
            backoff_base: parse(
                &get,
                "DISPATCH_LLM_BACKOFF_BASE",
                defaults.gateway.backoff_base,
            )?,
            fallbacks,
        };
        if !gateway.backoff_base.is_finite() || gateway.backoff_base < 0.0 {
            return Err(invalid(
                "DISPATCH_LLM_BACKOFF_BASE",
                "must be a non-negative number",
            ));
        }

        let research = ResearchConfig {
            search_url: get("DISPATCH_SEARCH_URL").unwrap_or(defaults.research.search_url),
            fetch_timeout: positive_secs(
                &get,
                "DISPATCH_FETCH_TIMEOUT_SECS",
                defaults.research.fetch_timeout,
            )?,
        };

        let agents = match get("DISPATCH_AGENTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<AgentSpec>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|message| invalid("DISPATCH_AGENTS", message))?,
            None => Vec::new(),
        };

        Ok(Self {
            db_path: get("DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            workspace_dir: get("DISPATCH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            log_dir: get("DISPATCH_LOG_DIR").map(PathBuf::from),
            scheduler,
            gateway,
            research,
            pipeline: defaults.pipeline,
            agents,
        })
    }

    /// Override the poll interval (the first CLI argument).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler.poll_interval = interval;
        self
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_secs()).map(Duration::from_secs)
}

/// Like `secs`, but zero is rejected.
fn positive_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = secs(get, key, default)?;
    if value.is_zero() {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, format!("expected a boolean, got '{v}'"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<DispatchConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatchConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.stale_threshold, Duration::from_secs(1800));
        assert!(config.scheduler.recover_on_startup);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.pipeline.max_queries, 8);
        assert!(config.gateway.api_key.is_none());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DISPATCH_POLL_INTERVAL_SECS", "3"),
            ("DISPATCH_LLM_RETRIES", "0"),
            ("DISPATCH_LLM_BACKOFF_BASE", "1.5"),
            ("DISPATCH_RECOVER_ON_STARTUP", "off"),
            ("DISPATCH_MODEL_FALLBACKS", "big=small"),
            ("DISPATCH_LLM_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(3));
        assert_eq!(config.gateway.max_attempts, 1);
        assert_eq!(config.gateway.backoff_base, 1.5);
        assert!(!config.scheduler.recover_on_startup);
        assert_eq!(config.gateway.fallbacks.fallback_for("big"), Some("small"));
        assert!(config.gateway.api_key.is_some());
    }

    #[test]
    fn invalid_number_names_the_key() {
        let err = load(&[("DISPATCH_STALE_THRESHOLD_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "DISPATCH_STALE_THRESHOLD_SECS")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in [
            "DISPATCH_POLL_INTERVAL_SECS",
            "DISPATCH_PIPELINE_DEADLINE_SECS",
            "DISPATCH_LLM_TIMEOUT_SECS",
            "DISPATCH_FETCH_TIMEOUT_SECS",
        ] {
            match load(&[(key, "0")]).unwrap_err() {
                ConfigError::InvalidValue { key: got, .. } => assert_eq!(got, key),
                other => panic!("unexpected error: {other}"),
            }
        }
        let config = load(&[("DISPATCH_STALE_THRESHOLD_SECS", "0")]).unwrap();
        assert!(config.scheduler.stale_threshold.is_zero());
    }

    #[test]
    fn negative_backoff_is_rejected() {
        assert!(load(&[("DISPATCH_LLM_BACKOFF_BASE", "-1")]).is_err());
    }

    #[test]
    fn agents_parse_with_colon_models() {
        let config = load(&[(
            "DISPATCH_AGENTS",
            "small:llama3.1:8b:1:4, large:llama3.1:70b:5:10",
        )])
        .unwrap();
        assert_eq!(
            config.agents,
            vec![
                AgentSpec {
                    name: "small".into(),
                    model: "llama3.1:8b".into(),
                    min_complexity: 1,
                    max_complexity: 4
                },
                AgentSpec {
                    name: "large".into(),
                    model: "llama3.1:70b".into(),
                    min_complexity: 5,
                    max_complexity: 10
                },
            ]
        );
    }

    #[test]
    fn bad_agent_spec_is_rejected() {
        assert!(load(&[("DISPATCH_AGENTS", "solo:model:9:1")]).is_err());
        assert!(load(&[("DISPATCH_AGENTS", "missing-band")]).is_err());
    }
}
