use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("{url} exposes no request gauges")]
    NoGauges { url: String },
}

/// Queue state of one model server, as exposed on its `/metrics` page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineLoad {
    pub waiting: u64,
    pub running: u64,
}

impl EngineLoad {
    /// Load signal fed to the registry.
    pub fn total(&self) -> u64 {
        self.waiting.saturating_add(self.running)
    }
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Fetch `{base_url}/metrics` and parse the request gauges.
pub async fn scrape_engine_load(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<EngineLoad, ScrapeError> {
    let url = format!("{}/metrics", base_url.trim_end_matches('/'));
    let resp = http
        .get(&url)
        .send()
        .await
        .map_err(|source| ScrapeError::Http {
            url: url.clone(),
            source,
        })?;
    if !resp.status().is_success() {
        return Err(ScrapeError::Status {
            url,
            status: resp.status().as_u16(),
        });
    }
    let text = resp.text().await.map_err(|source| ScrapeError::Http {
        url: url.clone(),
        source,
    })?;
    parse_engine_load(&text).ok_or(ScrapeError::NoGauges { url })
}

/// Parse vLLM gauges out of a Prometheus text page. Returns `None` when neither
/// gauge is present, so a page from some other server does not read as idle.
///
/// Handles both `vllm:num_requests_waiting{...} 3` and the underscore form
/// `vllm_num_requests_waiting{...} 3`. Gauges reported once per engine are
/// summed.
pub fn parse_engine_load(text: &str) -> Option<EngineLoad> {
    let mut load = EngineLoad::default();
    let mut seen = false;

    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }
        if let Some(val) = extract_metric(line, "num_requests_waiting") {
            load.waiting = load.waiting.saturating_add(val as u64);
            seen = true;
        } else if let Some(val) = extract_metric(line, "num_requests_running") {
            load.running = load.running.saturating_add(val as u64);
            seen = true;
        }
    }

    seen.then_some(load)
}

/// Numeric value of a Prometheus line whose metric name ends in `metric_suffix`.
fn extract_metric(line: &str, metric_suffix: &str) -> Option<f64> {
    let name = line
        .split(|c: char| c == '{' || c.is_whitespace())
        .next()?;
    let has_metric = name.ends_with(&format!(":{metric_suffix}"))
        || name.ends_with(&format!("_{metric_suffix}"));
    if !has_metric {
        return None;
    }

    let value_str = line.rsplit_once(|c: char| c.is_whitespace())?.1;
    let value = value_str.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}
