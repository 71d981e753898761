use std::{
    env,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use iotflow::{
    FlowOrchestrator,
    broker::{BrokerConnector, BrokerOptions, MemoryBroker, MqttConnector, QoS},
    config::{ConfigManager, ROOT_KEY, RuntimeConfig},
    device::DeviceConnection,
    flow_commands::{Demo, load_flow, validate_flow_file, write_demo, write_schema},
    handler::ScriptCompiler,
    logger::{LogLevel, init_tracing},
    observer::{Fanout, FlowEvent, FlowObserver, TracingObserver},
    watcher::{FileWatcher, WatchedType, same_file},
};
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "iotflow",
    about = "Run device flows over an MQTT broker",
    version
)]
struct Cli {
    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a flow and keep it running until Ctrl-C
    Run(RunArgs),

    /// Check a flow file without connecting anything
    Validate { file: PathBuf },

    /// Send one request from an ad-hoc device
    Call(CallArgs),

    /// Write one of the built-in demo flows
    Demo { name: Demo, out: PathBuf },

    /// Write the JSON-Schema of the flow file format
    Schema { out: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,

    /// Use an in-process broker instead of MQTT
    #[arg(long)]
    local: bool,

    /// Restart the flow when the file changes
    #[arg(long)]
    watch: bool,

    /// Publish nodes to fire once the flow is up
    #[arg(long = "fire", value_name = "NODE_ID")]
    fire: Vec<String>,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Device id used as the requester
    requester: String,

    /// `device.action`
    address: String,

    /// JSON payload; plain text is sent as a string
    #[arg(default_value = "{}")]
    payload: String,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Do not wait for the reply
    #[arg(long = "async")]
    fire_and_forget: bool,

    #[arg(long)]
    broker_url: Option<String>,
}

fn resolve_root_dir() -> PathBuf {
    env::var(ROOT_KEY)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./iotflow"))
}

fn connector(local: bool) -> Arc<dyn BrokerConnector> {
    if local {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(MqttConnector::new())
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let log_level = LogLevel::parse_lenient(&cli.log_level);
    if let Err(e) = init_tracing(&root.join("logs"), "iotflow.log", "requests.json", log_level) {
        eprintln!("logging to files disabled: {e:#}");
    }
    let config = ConfigManager::env(root.join("config").join(".env"));
    let runtime = RuntimeConfig::load(&config).await;

    match cli.command {
        Commands::Run(args) => run(args, runtime).await,
        Commands::Validate { file } => {
            let summary = validate_flow_file(&file, &ScriptCompiler::new(runtime.script_max_operations))?;
            println!(
                "{}: {} devices, {} functions, {} publish, {} subscribe, {} edges",
                file.display(),
                summary.devices,
                summary.functions,
                summary.publishes,
                summary.subscribes,
                summary.edges
            );
            for warning in &summary.warnings {
                println!("  warning: {warning}");
            }
            if summary.warnings.is_empty() {
                println!("flow is valid");
            }
            Ok(())
        }
        Commands::Call(args) => call(args, runtime).await,
        Commands::Demo { name, out } => {
            write_demo(name, &out)?;
            println!("demo flow written to {}", out.display());
            Ok(())
        }
        Commands::Schema { out } => {
            write_schema(&out)?;
            println!("schema written to {}", out.display());
            Ok(())
        }
    }
}

/// Counts the failure events of a run for the shutdown summary.
#[derive(Default)]
struct FailureCount(AtomicUsize);

impl FlowObserver for FailureCount {
    fn notify(&self, event: &FlowEvent) {
        if event.is_failure() {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run(args: RunArgs, runtime: RuntimeConfig) -> Result<()> {
    let failures = Arc::new(FailureCount::default());
    let orchestrator = Arc::new(
        FlowOrchestrator::new(
            connector(args.local),
            Arc::new(ScriptCompiler::new(runtime.script_max_operations)),
            runtime,
        )
        .with_observer(Arc::new(Fanout(vec![Arc::new(TracingObserver), failures.clone()]))),
    );

    let flow = load_flow(&args.file)?;
    start_and_fire(&orchestrator, flow, &args.fire).await?;

    let watcher = if args.watch {
        let dir = match args.file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let reloader = Arc::new(FlowReloader {
            file: args.file.clone(),
            orchestrator: orchestrator.clone(),
            fire: args.fire.clone(),
        });
        Some(FileWatcher::new(&dir, reloader).context("starting file watcher")?)
    } else {
        None
    };

    info!("flow running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    let stopped = orchestrator.stop().await;
    info!(
        devices = stopped,
        failures = failures.0.load(Ordering::Relaxed),
        "flow stopped"
    );
    Ok(())
}

async fn start_and_fire(orchestrator: &FlowOrchestrator, flow: iotflow::Flow, fire: &[String]) -> Result<()> {
    let report = orchestrator.start(flow).await?;
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        actions = report.actions.len(),
        subscriptions = report.subscriptions.len(),
        "flow started"
    );
    for issue in report.failed.iter().chain(&report.skipped) {
        warn!(node = %issue.node_id, reason = %issue.reason, "device not running");
    }
    for node_id in fire {
        match orchestrator.fire_publish(node_id).await {
            Ok(Some(reply)) => info!(node = %node_id, %reply, "publish answered"),
            Ok(None) => info!(node = %node_id, "publish sent"),
            Err(e) => error!(node = %node_id, error = %e, "publish failed"),
        }
    }
    Ok(())
}

/// Restarts the running flow whenever its file changes.
struct FlowReloader {
    file: PathBuf,
    orchestrator: Arc<FlowOrchestrator>,
    fire: Vec<String>,
}

#[async_trait]
impl WatchedType for FlowReloader {
    fn is_relevant(&self, path: &Path) -> bool {
        same_file(&self.file, path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        // parse first so a half-written file leaves the running flow alone
        let flow = load_flow(path)?;
        info!(file = %path.display(), "flow changed, restarting");
        self.orchestrator.stop().await;
        start_and_fire(&self.orchestrator, flow, &self.fire).await
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        warn!(file = %path.display(), "flow file removed; the running flow keeps going");
        Ok(())
    }
}

async fn call(args: CallArgs, runtime: RuntimeConfig) -> Result<()> {
    let url = args.broker_url.unwrap_or_else(|| runtime.broker_url.clone());
    let options = BrokerOptions::new(url, args.requester.clone())
        .with_credentials(runtime.username.clone(), runtime.password.clone())
        .with_keep_alive(runtime.keep_alive_secs)
        .with_max_packet_size(runtime.max_packet_size);
    let device = DeviceConnection::with_default_timeout(options, Arc::new(MqttConnector::new()), runtime.request_timeout);
    device.connect().await?;

    let payload: Value = serde_json::from_str(&args.payload).unwrap_or(Value::String(args.payload.clone()));
    let outcome = if args.fire_and_forget {
        device
            .publish(&args.address, payload, QoS::AtMostOnce)
            .await
            .map(|()| None)
    } else {
        device
            .request(
                &args.address,
                payload,
                args.timeout_ms.map(Duration::from_millis),
                QoS::AtMostOnce,
            )
            .await
            .map(Some)
    };
    if let Err(e) = device.disconnect().await {
        warn!(error = %e, "disconnect failed");
    }

    match outcome {
        Ok(Some(reply)) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        Ok(None) => {
            println!("sent");
            Ok(())
        }
        Err(e) => bail!("{} failed: {}", args.address, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_has_no_local_broker_flag() {
        let cli = Cli::try_parse_from(["iotflow", "call", "me", "lamp.on", "--broker-url", "mqtt://x"]).unwrap();
        assert!(matches!(cli.command, Commands::Call(ref args) if args.broker_url.as_deref() == Some("mqtt://x")));
        assert!(Cli::try_parse_from(["iotflow", "call", "me", "lamp.on", "--local"]).is_err());
        assert!(Cli::try_parse_from(["iotflow", "run", "flow.json", "--local"]).is_ok());
    }

    #[test]
    fn failure_count_only_counts_failures() {
        let failures = Arc::new(FailureCount::default());
        let fanout = Fanout(vec![Arc::new(TracingObserver), failures.clone()]);
        fanout.notify(&FlowEvent::RunStarted { devices: 1 });
        fanout.notify(&FlowEvent::SubscriptionHandlerFailed {
            node_id: "n2".into(),
            topic: "alarms/kitchen".into(),
            reason: "level too high".into(),
        });
        fanout.notify(&FlowEvent::DisconnectFailed {
            device_id: "hub".into(),
            reason: "broker gone".into(),
        });
        assert_eq!(failures.0.load(Ordering::Relaxed), 2);
    }
}
