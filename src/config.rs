use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub urls: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Outstanding publishes above which `/health` reports busy.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_topic() -> String {
    "search_results".to_string()
}
fn default_publish_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_queue_threshold() -> usize {
    64
}
fn default_drain_timeout_ms() -> u64 {
    5000
}

impl BrokerConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            query_param: default_query_param(),
            timeout_secs: default_search_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://www.baidu.com/s".to_string()
}
fn default_query_param() -> String {
    "wd".to_string()
}
fn default_search_timeout_secs() -> u64 {
    10
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
        }
    }
}

fn default_rate_per_sec() -> f64 {
    100.0
}
fn default_burst() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorrelationConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    100
}

impl CorrelationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// When set, `relay ask` triggers searches through a remote ingress
    /// service instead of in-process.
    #[serde(default)]
    pub trigger_url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generation_endpoint(),
            model: default_model(),
            timeout_secs: default_generation_timeout_secs(),
            trigger_url: None,
        }
    }
}

fn default_generation_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    300
}

/// User-facing text injected into prompts. Kept out of code so deployments
/// can localise them.
#[derive(Debug, Deserialize, Clone)]
pub struct MessagesConfig {
    #[serde(default = "default_network_unavailable")]
    pub network_unavailable: String,
    #[serde(default = "default_timeout_fallback")]
    pub timeout_fallback: String,
    /// Must contain `{content}` and `{prompt}`.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            network_unavailable: default_network_unavailable(),
            timeout_fallback: default_timeout_fallback(),
            prompt_template: default_prompt_template(),
        }
    }
}

fn default_network_unavailable() -> String {
    "Network resources are currently unavailable; answer from local knowledge.".to_string()
}
fn default_timeout_fallback() -> String {
    "(Network search timed out; answer from local knowledge.)".to_string()
}
fn default_prompt_template() -> String {
    "Answer the question using the following search results: {content}. Question: {prompt}"
        .to_string()
}

impl MessagesConfig {
    /// Interpolate search content and the caller's prompt into the template.
    ///
    /// Single pass: placeholder text inside `content` or `prompt` is left as-is.
    pub fn render_prompt(&self, content: &str, prompt: &str) -> String {
        let mut out =
            String::with_capacity(self.prompt_template.len() + content.len() + prompt.len());
        let mut rest = self.prompt_template.as_str();
        while let Some(pos) = rest.find('{') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("{content}") {
                out.push_str(content);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("{prompt}") {
                out.push_str(prompt);
                rest = after;
            } else {
                out.push('{');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults for local runs: loopback broker and bind address.
    #[cfg(test)]
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:8080".to_string(),
            },
            broker: BrokerConfig {
                urls: vec!["amqp://127.0.0.1:5672/%2f".to_string()],
                topic: default_topic(),
                publish_timeout_ms: default_publish_timeout_ms(),
                max_retries: default_max_retries(),
                retry_backoff_ms: default_retry_backoff_ms(),
                queue_threshold: default_queue_threshold(),
                drain_timeout_ms: default_drain_timeout_ms(),
            },
            search: SearchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            correlation: CorrelationConfig::default(),
            generation: GenerationConfig::default(),
            messages: MessagesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

// Upper bounds keep every configured duration well inside `Instant` range.
const MAX_PUBLISH_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MAX_RETRY_BACKOFF_MS: u64 = 60 * 1000;
const MAX_DRAIN_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MAX_DEADLINE_SECS: u64 = 60 * 60;
const MAX_POLL_INTERVAL_MS: u64 = 60 * 1000;

pub fn validate(config: &Config) -> Result<()> {
    // Validate broker
    if config.broker.urls.is_empty() {
        anyhow::bail!("broker.urls must list at least one endpoint");
    }
    if config.broker.topic.trim().is_empty() {
        anyhow::bail!("broker.topic must not be empty");
    }
    if config.broker.publish_timeout_ms == 0 {
        anyhow::bail!("broker.publish_timeout_ms must be > 0");
    }
    if config.broker.publish_timeout_ms > MAX_PUBLISH_TIMEOUT_MS {
        anyhow::bail!(
            "broker.publish_timeout_ms must be <= {}",
            MAX_PUBLISH_TIMEOUT_MS
        );
    }
    if config.broker.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
        anyhow::bail!("broker.retry_backoff_ms must be <= {}", MAX_RETRY_BACKOFF_MS);
    }
    if config.broker.drain_timeout_ms > MAX_DRAIN_TIMEOUT_MS {
        anyhow::bail!("broker.drain_timeout_ms must be <= {}", MAX_DRAIN_TIMEOUT_MS);
    }

    // Validate search
    if config.search.max_body_bytes == 0 {
        anyhow::bail!("search.max_body_bytes must be > 0");
    }
    if config.search.timeout_secs == 0 {
        anyhow::bail!("search.timeout_secs must be > 0");
    }

    // Validate rate limiting
    if !(config.rate_limit.rate_per_sec > 0.0) {
        anyhow::bail!("rate_limit.rate_per_sec must be > 0");
    }
    if config.rate_limit.burst == 0 {
        anyhow::bail!("rate_limit.burst must be >= 1");
    }

    // Validate correlation
    if config.correlation.deadline_secs == 0 {
        anyhow::bail!("correlation.deadline_secs must be > 0");
    }
    if config.correlation.deadline_secs > MAX_DEADLINE_SECS {
        anyhow::bail!("correlation.deadline_secs must be <= {}", MAX_DEADLINE_SECS);
    }
    if config.correlation.poll_interval_ms == 0 {
        anyhow::bail!("correlation.poll_interval_ms must be > 0");
    }
    if config.correlation.poll_interval_ms > MAX_POLL_INTERVAL_MS {
        anyhow::bail!(
            "correlation.poll_interval_ms must be <= {}",
            MAX_POLL_INTERVAL_MS
        );
    }

    let template = &config.messages.prompt_template;
    if !template.contains("{content}") || !template.contains("{prompt}") {
        anyhow::bail!("messages.prompt_template must contain {{content}} and {{prompt}}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(body: &str) -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("relay.toml");
        fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let (_tmp, path) = write_config(
            r#"[server]
bind = "127.0.0.1:9000"

[broker]
urls = ["amqp://localhost:5672/%2f"]
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.broker.topic, "search_results");
        assert_eq!(cfg.broker.publish_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.rate_limit.burst, 200);
        assert_eq!(cfg.correlation.deadline(), Duration::from_secs(10));
        assert_eq!(cfg.correlation.poll_interval(), Duration::from_millis(100));
        assert!(cfg.generation.trigger_url.is_none());
    }

    #[test]
    fn test_rejects_empty_broker_list() {
        let (_tmp, path) = write_config(
            r#"[server]
bind = "127.0.0.1:9000"

[broker]
urls = []
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("broker.urls"));
    }

    #[test]
    fn test_rejects_zero_rate() {
        let (_tmp, path) = write_config(
            r#"[server]
bind = "127.0.0.1:9000"

[broker]
urls = ["amqp://localhost"]

[rate_limit]
rate_per_sec = 0.0
burst = 1
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_oversized_durations() {
        let mut cfg = Config::minimal();
        cfg.correlation.deadline_secs = u64::MAX;
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("correlation.deadline_secs"));

        let mut cfg = Config::minimal();
        cfg.correlation.poll_interval_ms = u64::MAX;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::minimal();
        cfg.broker.retry_backoff_ms = u64::MAX;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::minimal();
        cfg.broker.publish_timeout_ms = u64::MAX;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::minimal();
        cfg.correlation.deadline_secs = MAX_DEADLINE_SECS;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_rejects_template_without_placeholders() {
        let mut cfg = Config::minimal();
        cfg.messages.prompt_template = "no placeholders".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_render_prompt() {
        let messages = MessagesConfig::default();
        let rendered = messages.render_prompt("sunny", "weather?");
        assert_eq!(
            rendered,
            "Answer the question using the following search results: sunny. Question: weather?"
        );
    }

    #[test]
    fn test_render_prompt_does_not_expand_content() {
        let messages = MessagesConfig {
            prompt_template: "{content} | {prompt} {x}".to_string(),
            ..MessagesConfig::default()
        };
        let rendered = messages.render_prompt("see {prompt}", "q");
        assert_eq!(rendered, "see {prompt} | q {x}");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
