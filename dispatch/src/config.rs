use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct EndpointConfig {
    pub url: String,
    /// Lower priority wins endpoint selection ties.
    #[serde(default)]
    pub priority: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RateLimitSettings {
    pub global_rate: f64,
    pub global_capacity: f64,
    pub per_key_rate: f64,
    pub per_key_capacity: f64,
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_rate: 20.0,
            global_capacity: 40.0,
            per_key_rate: 5.0,
            per_key_capacity: 10.0,
            acquire_timeout_secs: 15,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct NonceSettings {
    pub reservation_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long terminal tickets stay around for audit before GC.
    pub audit_retention_secs: u64,
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: 120,
            sweep_interval_secs: 30,
            audit_retention_secs: 600,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct DispatchConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub max_rps: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Base backoff in seconds; attempt n sleeps backoff_factor * 2^n + jitter.
    #[serde(default)]
    pub backoff_factor: f64,
    #[serde(default)]
    pub hedging_enabled: bool,
    #[serde(default)]
    pub hedge_threshold_ms: u64,
    #[serde(default)]
    pub health_interval_secs: u64,
    #[serde(default)]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub job_join_timeout_secs: u64,
    /// How long an executor watches for a receipt before moving on.
    #[serde(default)]
    pub receipt_wait_secs: u64,
    #[serde(default)]
    pub receipt_poll_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub nonce: NonceSettings,
}

impl DispatchConfig {
    pub fn load() -> Self {
        let mut cfg = Self {
            endpoints: vec![EndpointConfig {
                url: "http://127.0.0.1:8545".to_string(),
                priority: 0,
            }],
            max_rps: 10,
            max_retries: 3,
            backoff_factor: 0.5,
            hedging_enabled: false,
            hedge_threshold_ms: 750,
            health_interval_secs: 15,
            probe_timeout_secs: 5,
            request_timeout_secs: 30,
            job_join_timeout_secs: 10,
            receipt_wait_secs: 45,
            receipt_poll_secs: 3,
            rate_limit: RateLimitSettings::default(),
            nonce: NonceSettings::default(),
        };

        // Config file first, env vars override it below.
        if let Ok(txt) = std::fs::read_to_string("dispatch_config.json") {
            match serde_json::from_str::<DispatchConfig>(&txt) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(e) => eprintln!("⚠️  Failed to parse dispatch_config.json: {}", e),
            }
        }

        if let Ok(urls) = std::env::var("CHAINDESK_RPC_URLS") {
            let endpoints: Vec<EndpointConfig> = urls
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .enumerate()
                .map(|(i, url)| EndpointConfig {
                    url: url.to_string(),
                    priority: i as u32,
                })
                .collect();
            if !endpoints.is_empty() {
                cfg.endpoints = endpoints;
            }
        }
        if let Ok(v) = std::env::var("CHAINDESK_MAX_RPS") {
            cfg.max_rps = v.parse().unwrap_or(10);
        }
        if let Ok(v) = std::env::var("CHAINDESK_MAX_RETRIES") {
            cfg.max_retries = v.parse().unwrap_or(3);
        }
        if let Ok(v) = std::env::var("CHAINDESK_BACKOFF_FACTOR") {
            cfg.backoff_factor = v.parse().unwrap_or(0.5);
        }
        if let Ok(v) = std::env::var("CHAINDESK_HEDGING") {
            cfg.hedging_enabled = matches!(v.as_str(), "1" | "true" | "on");
        }
        if let Ok(v) = std::env::var("CHAINDESK_HEDGE_THRESHOLD_MS") {
            cfg.hedge_threshold_ms = v.parse().unwrap_or(750);
        }
        if let Ok(v) = std::env::var("CHAINDESK_HEALTH_INTERVAL") {
            cfg.health_interval_secs = v.parse().unwrap_or(15);
        }
        if let Ok(v) = std::env::var("CHAINDESK_PROBE_TIMEOUT") {
            cfg.probe_timeout_secs = v.parse().unwrap_or(5);
        }
        if let Ok(v) = std::env::var("CHAINDESK_REQUEST_TIMEOUT") {
            cfg.request_timeout_secs = v.parse().unwrap_or(30);
        }

        // Zero values would stall loops or disable timeouts entirely.
        if cfg.endpoints.is_empty() {
            eprintln!("⚠️  No RPC endpoints configured, falling back to localhost");
            cfg.endpoints.push(EndpointConfig {
                url: "http://127.0.0.1:8545".to_string(),
                priority: 0,
            });
        }
        if cfg.max_rps == 0 {
            cfg.max_rps = 10;
        }
        if cfg.backoff_factor <= 0.0 || !cfg.backoff_factor.is_finite() {
            cfg.backoff_factor = 0.5;
        }
        if cfg.hedge_threshold_ms == 0 {
            cfg.hedge_threshold_ms = 750;
        }
        if cfg.health_interval_secs == 0 {
            cfg.health_interval_secs = 15;
        }
        if cfg.probe_timeout_secs == 0 {
            cfg.probe_timeout_secs = 5;
        }
        if cfg.request_timeout_secs == 0 {
            cfg.request_timeout_secs = 30;
        }
        if cfg.job_join_timeout_secs == 0 {
            cfg.job_join_timeout_secs = 10;
        }
        if cfg.receipt_poll_secs == 0 {
            cfg.receipt_poll_secs = 3;
        }
        if cfg.rate_limit.global_rate <= 0.0 {
            cfg.rate_limit.global_rate = 20.0;
        }
        if cfg.rate_limit.global_capacity <= 0.0 {
            cfg.rate_limit.global_capacity = 40.0;
        }
        if cfg.rate_limit.per_key_rate <= 0.0 {
            cfg.rate_limit.per_key_rate = 5.0;
        }
        if cfg.rate_limit.per_key_capacity <= 0.0 {
            cfg.rate_limit.per_key_capacity = 10.0;
        }
        if cfg.nonce.reservation_timeout_secs == 0 {
            cfg.nonce.reservation_timeout_secs = 120;
        }
        if cfg.nonce.sweep_interval_secs == 0 {
            cfg.nonce.sweep_interval_secs = 30;
        }

        cfg
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn hedge_threshold(&self) -> Duration {
        Duration::from_millis(self.hedge_threshold_ms)
    }
}
