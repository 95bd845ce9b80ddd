//! Outstation Broker - certificate-authenticated per-connection outstations

use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use outstation_broker::{
    authorization::AuthorizationResolver,
    broker::Broker,
    certs::{CaParams, CertGenerator, ClientCertParams, GeneratedCert, ServerCertParams, load_certs, load_private_key},
    cli::{CertCommand, Cli, Command},
    config::Config,
    identity::canonical_subject_dn,
    outstation::{OutstationProvisioner, OutstationSettings},
    points::PointMappingLoader,
    ports::RangePortAllocator,
    relay::{Relay, server_config},
    setup_tracing,
    store::{ConfigurationStore, InMemoryConfigurationStore, InMemoryInstructionQueue, InMemoryTelemetryStore},
    trust::{TrustStoreBuilder, ensure_crypto_provider},
};

/// How often queued instructions are handed off.
const INSTRUCTION_DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    match cli.command {
        Some(Command::Cert(cert_cmd)) => run_cert_command(cert_cmd),
        Some(Command::Check) => run_check(cli.config.as_deref()).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

/// Run the broker
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // CLI overrides
    if let Some(port) = cli.port {
        config.relay.port = port;
    }
    if let Some(host) = cli.host {
        config.relay.host = host;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Broker error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    ensure_crypto_provider();

    let cert_path = config
        .relay
        .server_cert
        .as_deref()
        .context("relay.server_cert is required to serve")?;
    let key_path = config
        .relay
        .server_key
        .as_deref()
        .context("relay.server_key is required to serve")?;
    let tls = server_config(load_certs(cert_path)?, load_private_key(key_path)?)?;

    let store = Arc::new(InMemoryConfigurationStore::from_yaml_file(&config.store.tenants)?);
    let telemetry = Arc::new(InMemoryTelemetryStore::new());
    if let Some(seed) = &config.store.telemetry_seed {
        let count = telemetry.load_seed(seed)?;
        info!(readings = count, path = %seed.display(), "Telemetry seeded");
    }
    let queue = Arc::new(InMemoryInstructionQueue::new(config.store.instruction_capacity));
    let ports = Arc::new(RangePortAllocator::new(config.ports.first, config.ports.last)?);

    let provisioner = OutstationProvisioner::new(
        OutstationSettings {
            bind_host: config.backend.bind_host,
            max_frame_length: config.backend.max_frame_length,
            instruction_topic: config.backend.instruction_topic.clone(),
        },
        telemetry,
        Arc::clone(&queue) as _,
    );
    let broker = Arc::new(Broker::new(store, ports, provisioner));

    install_metrics_exporter(&config)?;

    let addr = format!("{}:{}", config.relay.host, config.relay.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind relay on {addr}"))?;

    info!("============================================================");
    info!("Outstation Broker v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================================");
    info!("Relay: {addr}");
    info!(
        "Backend ports: {}..={} on {}",
        config.ports.first, config.ports.last, config.backend.bind_host
    );
    info!("Tenant configuration: {}", config.store.tenants.display());
    info!("============================================================");

    let (shutdown_tx, _) = broadcast::channel(1);

    let dispatcher = tokio::spawn(dispatch_instructions(
        Arc::clone(&queue),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    let relay = Arc::new(Relay::new(
        Arc::clone(&broker),
        tls,
        config.relay.handshake_timeout,
    ));
    relay.serve(listener, shutdown_tx.subscribe()).await;

    info!("Shutting down backends...");
    broker.shutdown().await;
    let _ = dispatcher.await;

    Ok(())
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(config: &Config) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics.listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Cannot start Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics_exporter(config: &Config) -> anyhow::Result<()> {
    if config.metrics.listen.is_some() {
        warn!("metrics.listen is set but the `metrics` feature is disabled");
    }
    Ok(())
}

/// Hand queued instructions to the platform. Without a platform connection
/// they are logged.
async fn dispatch_instructions(
    queue: Arc<InMemoryInstructionQueue>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(INSTRUCTION_DISPATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for instruction in queue.drain() {
                    info!(
                        topic = %instruction.topic,
                        node = %instruction.node_id,
                        parameters = %instruction.parameters,
                        "Instruction dispatched"
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                let pending = queue.len();
                if pending > 0 {
                    warn!(pending, "Undispatched instructions dropped at shutdown");
                }
                break;
            }
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

// ─────────────────────────────────────────────────────────────────────────────
// check
// ─────────────────────────────────────────────────────────────────────────────

/// Validate configuration and tenant data without serving
async fn run_check(config_path: Option<&Path>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = match InMemoryConfigurationStore::from_yaml_file(&config.store.tenants) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("❌ Tenant configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let doc = store.document();
    let tenants: BTreeSet<_> = doc.auth.iter().map(|row| row.tenant_id.clone()).collect();
    println!("Tenant configuration: {}", config.store.tenants.display());
    println!("  Tenants:          {}", tenants.len());
    println!("  Client bindings:  {}", doc.auth.iter().filter(|r| r.enabled).count());
    println!("  Trusted issuers:  {}", doc.trusted_issuers.iter().filter(|r| r.enabled).count());
    println!("  Measurements:     {}", doc.measurements.iter().filter(|r| r.enabled).count());
    println!("  Controls:         {}", doc.controls.iter().filter(|r| r.enabled).count());

    let dyn_store: Arc<dyn ConfigurationStore> = Arc::clone(&store) as _;
    let resolver = AuthorizationResolver::new(Arc::clone(&dyn_store));
    let trust = TrustStoreBuilder::new(Arc::clone(&dyn_store));
    let points = PointMappingLoader::new(dyn_store);
    let mut problems = 0usize;

    for tenant in &tenants {
        match trust.build(tenant).await {
            Ok(policy) if policy.is_empty() => {
                println!("⚠️  {tenant}: no usable trusted issuer, every client will be refused");
            }
            Ok(_) => {}
            Err(e) => {
                println!("❌ {tenant}: {e}");
                problems += 1;
            }
        }
    }

    for row in doc.auth.iter().filter(|r| r.enabled) {
        let label = format!("{}/{} ({})", row.tenant_id, row.server_id, row.client_identifier);
        if let Err(e) = resolver.resolve(&row.client_identifier).await {
            println!("❌ {label}: {e}");
            problems += 1;
            continue;
        }
        match points.load(&row.tenant_id, &row.server_id).await {
            Ok(map) => println!(
                "✅ {label}: {} measurement(s), {} control(s)",
                map.measurements.len(),
                map.controls.len()
            ),
            Err(e) => {
                println!("❌ {label}: {e}");
                problems += 1;
            }
        }
    }

    if problems == 0 {
        ExitCode::SUCCESS
    } else {
        eprintln!("\n{problems} problem(s) found");
        ExitCode::FAILURE
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// cert
// ─────────────────────────────────────────────────────────────────────────────

/// Run certificate generation commands
fn run_cert_command(cmd: CertCommand) -> ExitCode {
    let result = match cmd {
        CertCommand::InitCa {
            cn,
            org,
            days,
            out_dir,
            name,
        } => CertGenerator::init_ca(&CaParams {
            cn: &cn,
            organization: org.as_deref(),
            validity_days: days,
        })
        .and_then(|cert| write_cert(&cert, &out_dir, &name)),
        CertCommand::IssueClient {
            cn,
            org,
            days,
            ca_cert,
            ca_key,
            out_dir,
            name,
        } => read_ca(&ca_cert, &ca_key).and_then(|(ca_cert_pem, ca_key_pem)| {
            let cert = CertGenerator::issue_client(
                &ClientCertParams {
                    cn: &cn,
                    organization: org.as_deref(),
                    validity_days: days,
                },
                &ca_cert_pem,
                &ca_key_pem,
            )?;
            write_cert(&cert, &out_dir, &name)?;
            let identifier = canonical_subject_dn(cert.cert_der().as_ref())?;
            println!("   client_identifier: {identifier}");
            Ok(())
        }),
        CertCommand::IssueServer {
            cn,
            san_dns,
            days,
            ca_cert,
            ca_key,
            out_dir,
            name,
        } => read_ca(&ca_cert, &ca_key).and_then(|(ca_cert_pem, ca_key_pem)| {
            let cert = CertGenerator::issue_server(
                &ServerCertParams {
                    cn: &cn,
                    san_dns,
                    validity_days: days,
                },
                &ca_cert_pem,
                &ca_key_pem,
            )?;
            write_cert(&cert, &out_dir, &name)
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn read_ca(cert: &Path, key: &Path) -> outstation_broker::Result<(String, String)> {
    let read = |p: &Path| {
        std::fs::read_to_string(p).map_err(|e| {
            outstation_broker::Error::Config(format!("Cannot read '{}': {e}", p.display()))
        })
    };
    Ok((read(cert)?, read(key)?))
}

fn write_cert(cert: &GeneratedCert, dir: &Path, name: &str) -> outstation_broker::Result<()> {
    CertGenerator::write_to_dir(cert, dir, name)?;
    println!("✅ Wrote {}", dir.join(format!("{name}.crt")).display());
    println!("✅ Wrote {}", dir.join(format!("{name}.key")).display());
    Ok(())
}
