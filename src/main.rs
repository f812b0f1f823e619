use cabundle_injector::controller::{CaBundleInjector, Settings};
use cabundle_injector::{telemetry, Error};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the injector
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the CA bundle source secret
    #[arg(long, env = "CA_BUNDLE_NAMESPACE")]
    source_namespace: String,

    /// Name of the CA bundle source secret
    #[arg(long, env = "CA_BUNDLE_SECRET_NAME")]
    source_secret: String,

    /// Name of the config map created in each opt-in namespace
    #[arg(long, env = "CA_BUNDLE_CONFIG_MAP_NAME", default_value = "ca-bundle")]
    config_map_name: String,

    /// Label namespaces use to opt in to injection
    #[arg(long, env = "CA_INJECTION_LABEL", default_value = "ca-bundle-injection")]
    label: String,

    /// Number of dispatch workers per work queue
    #[arg(long, env = "WORKER_COUNT", default_value_t = 2)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("CA Bundle Injector v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_injector(run_args).await,
    }
}

async fn run_injector(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        match telemetry::init_tracer() {
            Ok(tracer) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(error) => {
                registry.init();
                warn!("Failed to initialize OpenTelemetry tracing: {:?}", error);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!(
        "Starting CA Bundle Injector v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let settings = Settings {
        source_namespace: args.source_namespace,
        source_secret: args.source_secret,
        config_map_name: args.config_map_name,
        label: args.label,
    };

    // First shutdown signal triggers a graceful drain; workers finish their
    // current item before exiting.
    let shutdown = CancellationToken::new();
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("received interrupt, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            shutdown.cancel();
        });
    }

    let injector = CaBundleInjector::new(client, settings);
    let result = injector.run(args.workers, shutdown).await;

    telemetry::shutdown_telemetry();

    result
}
