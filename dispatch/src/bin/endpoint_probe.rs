use chaindesk_dispatch::config::DispatchConfig;
use chaindesk_dispatch::rpc::HealthChecker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("🧪 ChainDesk Endpoint Probe");
    println!("===========================");

    let cfg = DispatchConfig::load();
    println!("📂 {} endpoint(s) configured", cfg.endpoints.len());

    let checker = HealthChecker::new(
        &cfg.endpoints,
        cfg.request_timeout(),
        cfg.health_interval(),
        cfg.probe_timeout(),
    );

    println!("⏳ Probing (timeout {}s per endpoint)...", cfg.probe_timeout_secs);
    checker.probe_once().await;

    for snap in checker.snapshot().await {
        let status = if snap.is_healthy { "✅ OK " } else { "❌ DOWN" };
        let latency = snap
            .avg_latency_ms
            .map(|ms| format!("{:.1}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} p{} {:>8}  {}",
            status, snap.priority, latency, snap.url
        );
    }

    Ok(())
}
