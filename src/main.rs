//! relay-gate CLI entry point.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;
use relay_gate::config::{Args, ProxyConfig};
use relay_gate::{certgen, ProxyRuntime};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install default rustls crypto provider");

    let runtime = build_bootstrap_runtime();
    let exit_code = runtime.block_on(async move {
        if args.parent_tls || args.local_tls {
            // Best-effort convenience generation; missing files surface as
            // a fatal ConfigError once ProxyConfig::from_args reads them.
            certgen::ensure_cert(&args.cert, &args.key).await;
        }

        let config = match ProxyConfig::from_args(&args) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "configuration error");
                return 1;
            }
        };

        let proxy = match ProxyRuntime::new(config).await {
            Ok(proxy) => Arc::new(proxy),
            Err(e) => {
                error!(error = %e, "failed to initialize runtime");
                return 1;
            }
        };
        info!("relay-gate starting");
        match proxy.run().await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "fatal runtime error");
                1
            }
        }
    });

    std::process::exit(exit_code);
}

fn build_bootstrap_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus())
        .thread_name("relay-gate-worker")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}
