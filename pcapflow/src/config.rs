use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Application configuration, loadable from CLI, environment or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Capture file to drain (pcap or pcapng, optionally gzipped).
    #[serde(default = "default_pcap_path")]
    pub pcap_path: String,

    /// Port for the metrics endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Base URL of the document store.
    #[serde(default = "default_elastic_url")]
    pub elastic_url: String,

    /// Target index for packet documents.
    #[serde(default = "default_elastic_index")]
    pub elastic_index: String,

    /// Basic-auth user for the document store.
    #[serde(default)]
    pub elastic_user: Option<String>,

    /// Basic-auth password for the document store.
    #[serde(default)]
    pub elastic_password: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_elastic_timeout")]
    pub elastic_timeout_secs: u64,

    /// Total write attempts per record (first try included).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed pause between write attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Number of leading packets logged in detail.
    #[serde(default = "default_verbose_packets")]
    pub verbose_packets: usize,

    /// Number of dropped records logged at error level.
    #[serde(default = "default_failure_log_limit")]
    pub failure_log_limit: usize,

    /// Exit once the capture is drained instead of serving metrics until Ctrl-C.
    #[serde(default)]
    pub exit_on_complete: bool,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the metrics endpoint (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_pcap_path() -> String {
    "data/capture.pcapng".to_string()
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_elastic_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_elastic_index() -> String {
    "pcap-packets".to_string()
}

fn default_elastic_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_verbose_packets() -> usize {
    10
}

fn default_failure_log_limit() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pcap_path: default_pcap_path(),
            metrics_port: default_metrics_port(),
            elastic_url: default_elastic_url(),
            elastic_index: default_elastic_index(),
            elastic_user: None,
            elastic_password: None,
            elastic_timeout_secs: default_elastic_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            verbose_packets: default_verbose_packets(),
            failure_log_limit: default_failure_log_limit(),
            exit_on_complete: false,
            quiet: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.pcap != default_pcap_path() {
            self.pcap_path = cli.pcap.clone();
        }
        if cli.metrics_port != default_metrics_port() {
            self.metrics_port = cli.metrics_port;
        }
        if cli.elastic_url != default_elastic_url() {
            self.elastic_url = cli.elastic_url.clone();
        }
        if cli.elastic_index != default_elastic_index() {
            self.elastic_index = cli.elastic_index.clone();
        }
        if cli.elastic_user.is_some() {
            self.elastic_user = cli.elastic_user.clone();
        }
        if cli.elastic_password.is_some() {
            self.elastic_password = cli.elastic_password.clone();
        }
        if cli.elastic_timeout != default_elastic_timeout() {
            self.elastic_timeout_secs = cli.elastic_timeout;
        }
        if cli.max_retries != default_max_retries() {
            self.max_retries = cli.max_retries;
        }
        if cli.retry_delay_ms != default_retry_delay_ms() {
            self.retry_delay_ms = cli.retry_delay_ms;
        }
        if cli.verbose_packets != default_verbose_packets() {
            self.verbose_packets = cli.verbose_packets;
        }
        if cli.failure_log_limit != default_failure_log_limit() {
            self.failure_log_limit = cli.failure_log_limit;
        }
        if cli.exit_on_complete {
            self.exit_on_complete = true;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// pcapflow: ship a packet capture into a document store, with Prometheus counters
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to pcap/pcapng file.
    #[arg(long, env = "PCAP_PATH", default_value = "data/capture.pcapng")]
    pub pcap: String,

    /// Port to serve Prometheus metrics on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9100)]
    pub metrics_port: u16,

    /// Document store base URL.
    #[arg(long, env = "ELASTIC_URL", default_value = "http://localhost:9200")]
    pub elastic_url: String,

    /// Document store index name.
    #[arg(long, env = "ELASTIC_INDEX", default_value = "pcap-packets")]
    pub elastic_index: String,

    /// Basic-auth user for the document store.
    #[arg(long, env = "ELASTIC_USER")]
    pub elastic_user: Option<String>,

    /// Basic-auth password for the document store.
    #[arg(long, env = "ELASTIC_PASSWORD", hide_env_values = true)]
    pub elastic_password: Option<String>,

    /// Request timeout in seconds.
    #[arg(long, env = "ELASTIC_TIMEOUT", default_value_t = 10)]
    pub elastic_timeout: u64,

    /// Write attempts per record before it is counted as failed.
    #[arg(long, env = "ES_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Fixed delay between write attempts, in milliseconds.
    #[arg(long, env = "ES_RETRY_DELAY_MS", default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Log this many leading packets in detail.
    #[arg(long, default_value_t = 10)]
    pub verbose_packets: usize,

    /// Log at most this many dropped records.
    #[arg(long, default_value_t = 5)]
    pub failure_log_limit: usize,

    /// Exit when the capture is drained instead of serving metrics until Ctrl-C.
    #[arg(long)]
    pub exit_on_complete: bool,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to scrape metrics (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
