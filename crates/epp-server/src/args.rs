use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use epp_common::LogFormat;
use epp_scheduler::{ClassifierConfig, PickerConfig};

use crate::collector::CollectorConfig;
use crate::session::SessionConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Endpoint picker for Envoy external processing")]
pub struct Args {
    /// Pool of model servers this instance routes into.
    #[arg(long, env = "EPP_POOL_NAME")]
    pub pool_name: String,

    /// Log verbosity when RUST_LOG is unset (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, env = "EPP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, env = "EPP_GRPC_PORT", default_value_t = 9002)]
    pub grpc_port: u16,

    #[arg(long, env = "EPP_GRPC_HEALTH_PORT", default_value_t = 9003)]
    pub grpc_health_port: u16,

    #[arg(long, env = "EPP_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Route long prompts to prefill endpoints.
    #[arg(long = "pd-enabled", env = "PD_ENABLED", default_value_t = false)]
    pub pd_enabled: bool,

    /// Prompts strictly longer than this many tokens are split-eligible.
    #[arg(long = "pd-prompt-len-threshold", env = "PD_PROMPT_LEN_THRESHOLD", default_value_t = 512)]
    pub pd_prompt_len_threshold: u64,

    /// JSON file listing the pool's endpoints.
    #[arg(long, env = "EPP_ENDPOINTS_FILE")]
    pub endpoints_file: PathBuf,

    #[arg(long, env = "EPP_SCRAPE_INTERVAL_MS", default_value_t = 200)]
    pub scrape_interval_ms: u64,

    #[arg(long, env = "EPP_SCRAPE_TIMEOUT_MS", default_value_t = 1000)]
    pub scrape_timeout_ms: u64,

    /// Endpoints not seen for this long are dropped from the pool.
    #[arg(long, env = "EPP_ENDPOINT_TTL_MS", default_value_t = 10_000)]
    pub endpoint_ttl_ms: u64,

    /// Time allowed from request headers to routing decision.
    #[arg(long, env = "EPP_REQUEST_BUDGET_MS", default_value_t = 5_000)]
    pub request_budget_ms: u64,

    #[arg(long, env = "EPP_RESPONSE_IDLE_TIMEOUT_MS", default_value_t = 300_000)]
    pub response_idle_timeout_ms: u64,

    #[arg(long, env = "EPP_MAX_BODY_BYTES", default_value_t = 4 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// cl100k_base, o200k_base or none.
    #[arg(long, env = "EPP_TOKENIZER", default_value = "cl100k_base")]
    pub tokenizer: String,

    #[arg(long, env = "EPP_APPROXIMATE_SAFETY_FACTOR", default_value_t = 1.25)]
    pub approximate_safety_factor: f64,

    /// Effective load at which a picked endpoint is reported saturated.
    #[arg(long, env = "EPP_SATURATION_LOAD")]
    pub saturation_load: Option<u64>,

    #[arg(long, env = "EPP_APPROXIMATE_HEADROOM", default_value_t = 1)]
    pub approximate_headroom: u64,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_name.is_empty() {
            anyhow::bail!("--pool-name must not be empty");
        }
        if !(self.approximate_safety_factor.is_finite() && self.approximate_safety_factor >= 1.0) {
            anyhow::bail!(
                "--approximate-safety-factor must be >= 1.0, got {}",
                self.approximate_safety_factor
            );
        }
        if self.scrape_interval_ms == 0 {
            anyhow::bail!("--scrape-interval-ms must be positive");
        }
        if self.endpoint_ttl_ms <= self.scrape_interval_ms {
            anyhow::bail!("--endpoint-ttl-ms must exceed --scrape-interval-ms");
        }
        if self.request_budget_ms == 0 {
            anyhow::bail!("--request-budget-ms must be positive");
        }
        Ok(())
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            disaggregation_enabled: self.pd_enabled,
            prompt_len_threshold: self.pd_prompt_len_threshold,
            approximate_safety_factor: self.approximate_safety_factor,
            request_budget: Duration::from_millis(self.request_budget_ms),
        }
    }

    pub fn picker_config(&self) -> PickerConfig {
        PickerConfig {
            saturation_load: self.saturation_load,
            approximate_headroom: self.approximate_headroom,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_body_bytes: self.max_body_bytes,
            response_idle_timeout: Duration::from_millis(self.response_idle_timeout_ms),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            pool: self.pool_name.clone(),
            endpoints_file: self.endpoints_file.clone(),
            interval: Duration::from_millis(self.scrape_interval_ms),
            endpoint_ttl: Duration::from_millis(self.endpoint_ttl_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "epp",
            "--pool-name",
            "llama",
            "--endpoints-file",
            "/etc/epp/endpoints.json",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.grpc_port, 9002);
        assert_eq!(args.grpc_health_port, 9003);
        assert_eq!(args.metrics_port, 9090);
        assert!(!args.pd_enabled);
        assert_eq!(args.log_format, LogFormat::Text);
        args.validate().unwrap();

        let c = args.classifier_config();
        assert_eq!(c.request_budget, Duration::from_secs(5));
        assert_eq!(c.approximate_safety_factor, 1.25);
    }

    #[test]
    fn test_pd_flags_and_verbosity() {
        let args = parse(&[
            "--pd-enabled",
            "--pd-prompt-len-threshold",
            "1024",
            "-vv",
            "--log-format",
            "json",
        ]);
        assert!(args.pd_enabled);
        assert_eq!(args.pd_prompt_len_threshold, 1024);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(args.classifier_config().disaggregation_enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--approximate-safety-factor", "0.5"]).validate().is_err());
        assert!(parse(&["--endpoint-ttl-ms", "100"]).validate().is_err());
        assert!(parse(&["--request-budget-ms", "0"]).validate().is_err());
    }
}
