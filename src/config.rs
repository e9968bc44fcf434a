//! Gateway configuration and the immutable routing table.
//!
//! The JSON config file is parsed once into a [`RoutingTable`] snapshot plus
//! ambient settings. The table is immutable; replacing it is an atomic
//! pointer swap through [`TableHandle`], and in-flight requests keep the
//! snapshot they started with.

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialSpec;

/// Which codec family a pipeline speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Anthropic,
    OpenaiCompatible,
    Gemini,
    Codewhisperer,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderType::Anthropic => "anthropic",
            ProviderType::OpenaiCompatible => "openai_compatible",
            ProviderType::Gemini => "gemini",
            ProviderType::Codewhisperer => "codewhisperer",
        };
        f.write_str(s)
    }
}

/// Load-balancing strategy for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    LeastResponseTime,
    /// Base strategy until any candidate passes 80% of its concurrency cap,
    /// then least-response-time for that pick.
    Adaptive,
}

/// Virtual request category derived by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Default,
    Background,
    Thinking,
    Longcontext,
    Search,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Default => "default",
            Category::Background => "background",
            Category::Thinking => "thinking",
            Category::Longcontext => "longcontext",
            Category::Search => "search",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state stream override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForceStream {
    On,
    Off,
    #[default]
    Passthrough,
}

/// Message content shape the upstream insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentShape {
    String,
    Array,
}

/// Upstream-specific quirks, resolved once at table build. The codecs and
/// the compatibility stage read these; nothing does string-keyed lookups at
/// request time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompatibilityHints {
    /// Buffer the whole stream and extract free-form text tool calls
    /// before emitting anything.
    #[serde(default)]
    pub buffer_tool_calls: bool,

    #[serde(default)]
    pub force_stream: ForceStream,

    #[serde(default)]
    pub content_shape: Option<ContentShape>,

    /// Hard per-model output ceiling; the request transformer clamps to it.
    #[serde(default)]
    pub max_tokens_cap: Option<u32>,
}

/// One routable backend: a provider endpoint plus the model to address
/// there. Carries its own breaker and stats keyed by `pipeline_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEntry {
    /// Stable stats/breaker key. Derived from provider and model when the
    /// config omits it.
    #[serde(default)]
    pub pipeline_id: String,

    pub provider_id: String,
    pub provider_type: ProviderType,
    pub endpoint_url: String,
    pub credential_ref: String,
    pub upstream_model: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub max_retries: u32,

    /// Fallback when the caller omitted max_tokens.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default)]
    pub compatibility_hints: CompatibilityHints,
}

impl PipelineEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The ordered pipelines serving one category, plus its balancing knobs.
#[derive(Debug, Clone)]
pub struct CategoryRoute {
    pub entries: Vec<Arc<PipelineEntry>>,
    pub strategy: Strategy,
    pub sticky_session_ttl: Duration,
}

/// Classifier rules resolved at table build (patterns pre-compiled).
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    pub long_context_threshold: u32,
    pub search_tool: String,
    pub background_patterns: Vec<regex::Regex>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            search_tool: default_search_tool(),
            background_patterns: vec![regex::Regex::new(default_background_pattern())
                .expect("default pattern compiles")],
        }
    }
}

/// Circuit breaker tuning, shared by all pipelines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Ceiling for the exponential extension applied on re-open.
    #[serde(default = "default_max_recovery_timeout_ms")]
    pub max_recovery_timeout_ms: u64,

    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            max_recovery_timeout_ms: default_max_recovery_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn max_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.max_recovery_timeout_ms)
    }
}

/// Health probe tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures before `degraded` becomes `unhealthy`.
    #[serde(default = "default_probe_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_probe_failure_threshold(),
        }
    }
}

/// The immutable routing snapshot consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    categories: HashMap<Category, CategoryRoute>,
    default_category: Category,
    pub classifier: ClassifierRules,
}

impl RoutingTable {
    pub fn new(
        categories: HashMap<Category, CategoryRoute>,
        default_category: Category,
        classifier: ClassifierRules,
    ) -> Result<Self> {
        if !categories.contains_key(&default_category) {
            bail!("default category '{default_category}' has no pipelines configured");
        }
        Ok(Self {
            categories,
            default_category,
            classifier,
        })
    }

    pub fn default_category(&self) -> Category {
        self.default_category
    }

    /// The route for a category, falling back to the default category when
    /// the classified one has nothing configured.
    pub fn route(&self, category: Category) -> &CategoryRoute {
        self.categories.get(&category).unwrap_or_else(|| {
            self.categories
                .get(&self.default_category)
                .expect("default category validated at build")
        })
    }

    /// Every pipeline entry across all categories, deduplicated by id.
    /// Registry state is created from this set.
    pub fn all_entries(&self) -> Vec<Arc<PipelineEntry>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for route in self.categories.values() {
            for entry in &route.entries {
                if seen.insert(entry.pipeline_id.clone()) {
                    out.push(entry.clone());
                }
            }
        }
        out
    }
}

/// Atomic pointer to the current routing table. Readers take a snapshot
/// and hold it for the lifetime of one request; swaps never block readers.
pub struct TableHandle {
    inner: ArcSwap<RoutingTable>,
}

impl TableHandle {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            inner: ArcSwap::from_pointee(table),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.inner.load_full()
    }

    pub fn swap(&self, table: RoutingTable) {
        self.inner.store(Arc::new(table));
    }
}

// ============================================================================
// Config file parsing
// ============================================================================

/// Parsed JSON configuration (deserializable form).
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub categories: HashMap<String, CategoryFile>,

    #[serde(default = "default_category_name")]
    pub default_category: String,

    #[serde(default)]
    pub classifier: ClassifierFile,

    #[serde(default)]
    pub credentials: HashMap<String, CredentialSpec>,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// SSE channel buffer size per stream (number of chunks).
    #[serde(default = "default_sse_buffer_size")]
    pub sse_buffer_size: usize,

    /// Outer per-request deadline; retries never extend it.
    #[serde(default = "default_global_deadline_ms")]
    pub global_deadline_ms: u64,

    /// Cross-pipeline attempt cap per request.
    #[serde(default = "default_global_retry_cap")]
    pub global_retry_cap: u32,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryFile {
    pub pipelines: Vec<PipelineEntry>,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_sticky_ttl_ms")]
    pub sticky_session_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierFile {
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u32,

    #[serde(default = "default_search_tool")]
    pub search_tool: String,

    #[serde(default)]
    pub background_patterns: Vec<String>,
}

impl Default for ClassifierFile {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            search_tool: default_search_tool(),
            background_patterns: Vec::new(),
        }
    }
}

/// Runtime configuration shared across handlers. Wraps the parsed file
/// plus one shared `reqwest::Client` connection pool.
#[derive(Clone)]
pub struct GatewayConfig {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    host: String,
    port: u16,
    breaker: BreakerConfig,
    health: HealthConfig,
    sse_buffer_size: usize,
    global_deadline: Duration,
    global_retry_cap: u32,
    http_client: reqwest::Client,
}

impl GatewayConfig {
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn breaker(&self) -> BreakerConfig {
        self.inner.breaker
    }

    pub fn health(&self) -> HealthConfig {
        self.inner.health
    }

    pub fn sse_buffer_size(&self) -> usize {
        self.inner.sse_buffer_size
    }

    pub fn global_deadline(&self) -> Duration {
        self.inner.global_deadline
    }

    pub fn global_retry_cap(&self) -> u32 {
        self.inner.global_retry_cap
    }

    /// The shared HTTP client. One pool for all upstreams; per-call
    /// deadlines are attached per request, not here.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }
}

fn parse_category_name(name: &str) -> Result<Category> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("unknown category '{name}'"))
}

/// Build the routing table and runtime config from a parsed file.
pub fn build(file: ConfigFile) -> Result<(GatewayConfig, RoutingTable)> {
    let mut categories = HashMap::new();
    for (name, cat) in &file.categories {
        let category = parse_category_name(name)?;
        if cat.pipelines.is_empty() {
            bail!("category '{name}' has an empty pipeline list");
        }
        let entries = cat
            .pipelines
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let mut entry = entry.clone();
                validate_entry(&entry)
                    .with_context(|| format!("pipeline {idx} in category '{name}' is invalid"))?;
                if entry.pipeline_id.is_empty() {
                    entry.pipeline_id = format!("{}/{}", entry.provider_id, entry.upstream_model);
                }
                Ok(Arc::new(entry))
            })
            .collect::<Result<Vec<_>>>()?;

        categories.insert(
            category,
            CategoryRoute {
                entries,
                strategy: cat.strategy,
                sticky_session_ttl: Duration::from_millis(cat.sticky_session_ttl_ms),
            },
        );
    }

    let default_category = parse_category_name(&file.default_category)?;

    let background_patterns = file
        .classifier
        .background_patterns
        .iter()
        .map(|p| regex::Regex::new(p).with_context(|| format!("bad background pattern '{p}'")))
        .collect::<Result<Vec<_>>>()?;
    let classifier = ClassifierRules {
        long_context_threshold: file.classifier.long_context_threshold,
        search_tool: file.classifier.search_tool.clone(),
        background_patterns: if background_patterns.is_empty() {
            ClassifierRules::default().background_patterns
        } else {
            background_patterns
        },
    };

    let table = RoutingTable::new(categories, default_category, classifier)?;

    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(file.pool_max_idle_per_host)
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .build()
        .context("failed to build HTTP client")?;

    let config = GatewayConfig {
        inner: Arc::new(ConfigInner {
            host: file.host,
            port: file.port,
            breaker: file.breaker,
            health: file.health,
            sse_buffer_size: file.sse_buffer_size,
            global_deadline: Duration::from_millis(file.global_deadline_ms),
            global_retry_cap: file.global_retry_cap,
            http_client,
        }),
    };

    Ok((config, table))
}

/// Read and parse the config file, expanding `~` in the path and `${ENV}`
/// references in the raw text before parsing.
pub fn load(path: &str) -> Result<(GatewayConfig, RoutingTable, HashMap<String, CredentialSpec>)> {
    let expanded_path = shellexpand::tilde(path).to_string();
    let raw = fs::read_to_string(&expanded_path)
        .with_context(|| format!("failed to read config file: {expanded_path}"))?;
    let expanded = shellexpand::env(&raw)
        .map_err(|e| anyhow::anyhow!("config env expansion failed: {e}"))?
        .to_string();
    let file: ConfigFile = serde_json::from_str(&expanded).context("failed to parse config JSON")?;
    let credentials = file.credentials.clone();
    let (config, table) = build(file)?;
    Ok((config, table, credentials))
}

fn validate_entry(entry: &PipelineEntry) -> Result<()> {
    if entry.weight == 0 {
        bail!("weight must be >= 1");
    }
    if entry.max_concurrent == 0 {
        bail!("max_concurrent must be >= 1");
    }
    if !entry.endpoint_url.starts_with("http://") && !entry.endpoint_url.starts_with("https://") {
        bail!("endpoint_url must include a scheme: {}", entry.endpoint_url);
    }
    Ok(())
}

// ============================================================================
// Defaults
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_category_name() -> String {
    "default".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    64
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_long_context_threshold() -> u32 {
    60_000
}

fn default_search_tool() -> String {
    "web_search".to_string()
}

fn default_background_pattern() -> &'static str {
    r"(?i)haiku|mini|flash"
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_max_recovery_timeout_ms() -> u64 {
    300_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_failure_threshold() -> u32 {
    3
}

fn default_sse_buffer_size() -> usize {
    32
}

fn default_global_deadline_ms() -> u64 {
    600_000
}

fn default_global_retry_cap() -> u32 {
    3
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_sticky_ttl_ms() -> u64 {
    300_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_file() -> ConfigFile {
        serde_json::from_value(json!({
            "categories": {
                "default": {
                    "pipelines": [{
                        "provider_id": "lmstudio",
                        "provider_type": "openai_compatible",
                        "endpoint_url": "http://127.0.0.1:1234",
                        "credential_ref": "local",
                        "upstream_model": "qwen2.5-coder"
                    }]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn build_derives_pipeline_id() {
        let (_, table) = build(minimal_file()).unwrap();
        let entries = table.all_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pipeline_id, "lmstudio/qwen2.5-coder");
    }

    #[test]
    fn build_rejects_zero_weight() {
        let mut file = minimal_file();
        file.categories.get_mut("default").unwrap().pipelines[0].weight = 0;
        assert!(build(file).is_err());
    }

    #[test]
    fn build_rejects_missing_scheme() {
        let mut file = minimal_file();
        file.categories.get_mut("default").unwrap().pipelines[0].endpoint_url =
            "api.example.com".into();
        assert!(build(file).is_err());
    }

    #[test]
    fn build_rejects_default_category_without_pipelines() {
        let mut file = minimal_file();
        file.default_category = "thinking".into();
        assert!(build(file).is_err());
    }

    #[test]
    fn route_falls_back_to_default_category() {
        let (_, table) = build(minimal_file()).unwrap();
        let route = table.route(Category::Thinking);
        assert_eq!(route.entries[0].provider_id, "lmstudio");
    }

    #[test]
    fn entry_defaults_applied() {
        let (_, table) = build(minimal_file()).unwrap();
        let entry = &table.all_entries()[0];
        assert_eq!(entry.weight, 1);
        assert_eq!(entry.max_concurrent, 64);
        assert_eq!(entry.max_retries, 0);
        assert!(!entry.compatibility_hints.buffer_tool_calls);
        assert_eq!(
            entry.compatibility_hints.force_stream,
            ForceStream::Passthrough
        );
    }

    #[test]
    fn table_handle_swap_is_visible_to_new_snapshots() {
        let (_, table) = build(minimal_file()).unwrap();
        let handle = TableHandle::new(table);

        let before = handle.snapshot();
        assert_eq!(before.all_entries().len(), 1);

        let mut file = minimal_file();
        file.categories.get_mut("default").unwrap().pipelines.push(
            serde_json::from_value(json!({
                "provider_id": "ollama",
                "provider_type": "openai_compatible",
                "endpoint_url": "http://127.0.0.1:11434",
                "credential_ref": "local",
                "upstream_model": "llama3"
            }))
            .unwrap(),
        );
        let (_, next) = build(file).unwrap();
        handle.swap(next);

        // The old snapshot is unchanged; a new one sees the swap.
        assert_eq!(before.all_entries().len(), 1);
        assert_eq!(handle.snapshot().all_entries().len(), 2);
    }

    #[test]
    fn hints_parse_tri_state() {
        let hints: CompatibilityHints = serde_json::from_value(json!({
            "buffer_tool_calls": true,
            "force_stream": "off",
            "content_shape": "string",
            "max_tokens_cap": 4096
        }))
        .unwrap();
        assert!(hints.buffer_tool_calls);
        assert_eq!(hints.force_stream, ForceStream::Off);
        assert_eq!(hints.content_shape, Some(ContentShape::String));
        assert_eq!(hints.max_tokens_cap, Some(4096));
    }
}
