//! bucket-mesh: full-mesh bucket replication from the command line.

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_core::config::{Config, LogFormat};
use mesh_reconciler::{
    DeploymentScope, EventAdapter, LifecycleEvent, LifecycleResponse, MeshReconciler,
    PermissionSet, ProviderHandle, ProviderRegistry, RuleCompiler,
};
use mesh_s3::S3Backend;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::{Cli, Commands, HandleArgs, PermissionsArgs};

/// Scope used when neither the command line nor the event names one.
const DEFAULT_SCOPE: &str = "default";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle(args) => handle(args).await,
        Commands::Compile(args) => {
            let payload = read_payload(&args.event)?;
            compile(&payload)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Permissions(args) => {
            permissions(&args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("bucket-mesh {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Runs one lifecycle event against S3 and prints the response.
async fn handle(args: HandleArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    init_logging(&config)?;

    let payload = read_payload(&args.event.event)?;
    let event = match LifecycleEvent::from_json(&payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Rejected malformed event");
            print_response(&LifecycleResponse::rejected(&e), args.pretty)?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let scope = DeploymentScope::new(
        args.scope
            .clone()
            .or_else(|| event.context().stack_id.clone())
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        config.backend.locate_region.clone(),
    );

    let backend = S3Backend::load(config.backend.clone()).await;
    info!(?backend, scope = %scope, mode = %event.mode(), "Handling lifecycle event");

    let registry = ProviderRegistry::new();
    let provider = registry.get_or_register(&scope, || {
        let reconciler = MeshReconciler::new(Arc::new(backend))
            .with_config(config.reconciler.clone())
            .with_retry(config.retry.clone());
        EventAdapter::new(Arc::new(reconciler))
    });
    provider.grant(&PermissionSet::for_reconciler(&event.properties().to_spec()));
    if tracing::enabled!(Level::DEBUG) {
        debug!(
            actions = provider.permissions().action_count(),
            policy = %scope_policy(&provider)?,
            "Reconciler permissions for this scope"
        );
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let response = provider.adapter().handle(event, &cancel).await;
    print_response(&response, args.pretty)?;

    Ok(if response.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Prints the desired rules of every bucket. Makes no backend calls.
fn compile(payload: &str) -> Result<()> {
    let event = LifecycleEvent::from_json(payload).context("Failed to parse event")?;
    let spec = event
        .properties()
        .to_spec()
        .normalized()
        .context("Mesh declaration is invalid")?;
    let rules = RuleCompiler::compile_normalized(&spec);

    let output = json!({
        "physicalId": spec.physical_id(),
        "rules": rules,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Prints the policies needed to run every given mesh.
fn permissions(args: &PermissionsArgs) -> Result<()> {
    let mut reconciler = PermissionSet::new();
    let mut identity = PermissionSet::new();

    for source in &args.events {
        let payload = read_payload(source)?;
        let event = LifecycleEvent::from_json(&payload)
            .with_context(|| format!("Failed to parse event from {source}"))?;
        let spec = event.properties().to_spec();
        reconciler.merge(&PermissionSet::for_reconciler(&spec));
        identity.merge(&PermissionSet::for_replication_identity(&spec));
    }

    let output = json!({
        "reconciler": reconciler.to_policy_document(),
        "replicationIdentity": identity.to_policy_document(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// The policy a scope's reconciler needs for every mesh it has handled.
fn scope_policy(provider: &ProviderHandle) -> Result<String> {
    serde_json::to_string(&provider.policy_document()).context("Failed to render scope policy")
}

fn load_config(args: &HandleArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(max) = args.max_concurrency {
        config.reconciler.max_concurrency = max;
    }
    if args.dry_run {
        config.reconciler.dry_run = true;
    }
    if let Some(endpoint) = &args.endpoint_url {
        config.backend.endpoint_url = Some(endpoint.clone());
        config.backend.force_path_style = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Logs go to stderr; stdout carries the response.
fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        }
    }

    Ok(())
}

/// Reads a file, or stdin when `source` is `-`.
fn read_payload(source: &str) -> Result<String> {
    if source == "-" {
        let mut payload = String::new();
        std::io::stdin().read_to_string(&mut payload).context("Failed to read event from stdin")?;
        return Ok(payload);
    }
    std::fs::read_to_string(source).with_context(|| format!("Failed to read event from {source}"))
}

fn print_response(response: &LifecycleResponse, pretty: bool) -> Result<()> {
    let body = if pretty {
        serde_json::to_string_pretty(response)?
    } else {
        serde_json::to_string(response)?
    };
    println!("{body}");
    Ok(())
}

/// Cancels `token` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling reconciliation");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling reconciliation");
        }
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    const EVENT: &str = r#"{
        "requestType": "Create",
        "stackId": "stack-1",
        "buckets": [
            {"name": "x-2", "region": "us-west-2"},
            {"name": "x-1", "region": "us-east-1"}
        ],
        "replicationIdentityArn": "arn:aws:iam::111:role/repl"
    }"#;

    fn handle_args(config: Option<PathBuf>) -> HandleArgs {
        HandleArgs {
            event: cli::EventArgs { event: "-".to_string() },
            config,
            dry_run: false,
            max_concurrency: None,
            endpoint_url: None,
            scope: None,
            pretty: false,
        }
    }

    #[test]
    fn test_read_payload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EVENT.as_bytes()).unwrap();

        let payload = read_payload(file.path().to_str().unwrap()).unwrap();
        assert_eq!(payload, EVENT);
    }

    #[test]
    fn test_read_payload_missing_file() {
        let err = read_payload("/nonexistent/event.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/event.json"));
    }

    #[test]
    fn test_compile_event() {
        compile(EVENT).unwrap();
        let duplicate = r#"{
            "requestType": "Create",
            "buckets": [{"name": "x-1", "region": "us-east-1"}, {"name": "x-1", "region": "eu-west-1"}],
            "replicationIdentityArn": "arn:aws:iam::111:role/repl"
        }"#;
        assert!(compile(duplicate).is_err());
    }

    #[test]
    fn test_scope_policy_covers_handled_meshes() {
        let scope = DeploymentScope::new("stack-1", "us-east-1");
        let backend = Arc::new(mesh_reconciler::MemoryBackend::new());
        let registry = ProviderRegistry::new();
        let provider = registry.get_or_register(&scope, || {
            EventAdapter::new(Arc::new(MeshReconciler::new(backend)))
        });

        let event = LifecycleEvent::from_json(EVENT).unwrap();
        provider.grant(&PermissionSet::for_reconciler(&event.properties().to_spec()));

        let policy = scope_policy(&provider).unwrap();
        assert!(policy.contains("s3:PutReplicationConfiguration"));
        assert!(policy.contains("arn:aws:s3:::x-1"));
        assert!(policy.contains("arn:aws:s3:::x-2"));
        assert!(policy.contains("arn:aws:iam::111:role/repl"));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[reconciler]\nmax_concurrency = 4\n").unwrap();

        let mut args = handle_args(Some(file.path().to_path_buf()));
        let config = load_config(&args).unwrap();
        assert_eq!(config.reconciler.max_concurrency, 4);
        assert!(!config.reconciler.dry_run);

        args.max_concurrency = Some(2);
        args.dry_run = true;
        args.endpoint_url = Some("http://localhost:9000".to_string());
        let config = load_config(&args).unwrap();
        assert_eq!(config.reconciler.max_concurrency, 2);
        assert!(config.reconciler.dry_run);
        assert!(config.backend.force_path_style);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut args = handle_args(None);
        args.max_concurrency = Some(0);
        assert!(load_config(&args).is_err());
    }
}
