//! kube-csr - certificates through the Kubernetes CSR API

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use kube_csr::cli::{Cli, Commands, GcArgs, IssueArgs};
use kube_csr::gc::GarbageCollector;
use kube_csr::pipeline::{
    current_namespace, Approve, Delete, Fetch, Generate, Pipeline, Query, Submit,
};
use kube_csr::renew::RenewalScheduler;
use kube_csr::store::{
    create_client, KubeServiceLookup, KubeSigningRequestStore, SigningRequestStore,
};
use kube_csr::telemetry::{init_telemetry, TelemetryConfig};
use kube_csr::Error;

/// Why the process failed, mapped to its exit code
enum Failure {
    /// Invalid flags or an unreadable configuration (exit 1)
    Config(anyhow::Error),
    /// A stage or a garbage collection failed (exit 2)
    Operation(anyhow::Error),
}

impl Failure {
    fn config(e: impl Into<anyhow::Error>) -> Self {
        Self::Config(e.into())
    }

    fn operation(e: impl Into<anyhow::Error>) -> Self {
        Self::Operation(e.into())
    }

    /// A client that can't be built from a valid configuration is a remote failure
    fn client(e: Error) -> Self {
        match e {
            Error::RemoteUnavailable { .. } => Self::operation(e),
            _ => Self::config(e),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Install crypto provider - aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        return ExitCode::from(1);
    }

    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        verbosity: cli.verbose,
        ..Default::default()
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("Failed to initialize telemetry: {e}");
        return ExitCode::from(1);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let kubeconfig = cli.kubeconfig_path.as_deref();
    let result = match cli.command {
        Commands::Issue(args) => run_issue(kubeconfig, args, &cancel).await,
        Commands::GarbageCollect(args) => run_garbage_collect(kubeconfig, args, &cancel).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Config(e)) => {
            tracing::error!(error = %format!("{e:#}"), "invalid configuration");
            ExitCode::from(1)
        }
        Err(Failure::Operation(e)) => {
            tracing::error!(error = %format!("{e:#}"), "operation failed");
            ExitCode::from(2)
        }
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only SIGINT cancels");
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = terminate.recv() => tracing::info!("SIGTERM received"),
    }
    cancel.cancel();
}

/// Run the issue pipeline once, or keep renewing with `--renew`
async fn run_issue(
    kubeconfig: Option<&Path>,
    args: IssueArgs,
    cancel: &CancellationToken,
) -> Result<(), Failure> {
    args.validate().map_err(Failure::config)?;
    let stages = args.stages();

    let cwd = std::env::current_dir().map_err(Failure::config)?;
    let spec = args.spec(&cwd).map_err(Failure::config)?;
    tracing::info!(
        csr = %spec.name,
        cn = %spec.common_name,
        sans = ?spec.subject_alternative_names,
        ?stages,
        "issuing certificate"
    );

    let mut builder = Pipeline::builder(spec);
    if stages.generate {
        builder = builder.generate(Generate::new());
    }

    let remote = stages.query || stages.submit || stages.approve || stages.fetch || stages.delete;
    if remote {
        let client = create_client(kubeconfig).await.map_err(Failure::client)?;
        let store: Arc<dyn SigningRequestStore> =
            Arc::new(KubeSigningRequestStore::new(client.clone()));

        if stages.query {
            let in_cluster =
                kubeconfig.is_none() && std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
            let config = args
                .query_config(&current_namespace(in_cluster))
                .map_err(Failure::config)?;
            builder = builder.query(Query::new(Arc::new(KubeServiceLookup::new(client)), config));
        }
        if stages.submit {
            builder = builder.submit(Submit::new(store.clone()));
        }
        if stages.approve {
            builder = builder.approve(Approve::new(store.clone()));
        }
        if stages.fetch {
            let config = args.fetch_config().map_err(Failure::config)?;
            builder = builder.fetch(Fetch::new(store.clone(), config));
        }
        if stages.delete {
            builder = builder.delete(Delete::new(store));
        }
    }
    let mut pipeline = builder.build();

    let Some(renew) = args.renew_config() else {
        pipeline.run(cancel).await.map_err(Failure::operation)?;
        return Ok(());
    };

    if !pipeline.spec().certificate.path.exists() {
        tracing::info!(
            path = %pipeline.spec().certificate.path.display(),
            "no certificate yet, issuing one before renewing"
        );
        pipeline.run(cancel).await.map_err(Failure::operation)?;
    }
    let mut scheduler = RenewalScheduler::new(pipeline, renew).map_err(Failure::config)?;
    scheduler.run(cancel).await.map_err(Failure::operation)
}

/// Collect once, or once per polling period with `--daemon`
async fn run_garbage_collect(
    kubeconfig: Option<&Path>,
    args: GcArgs,
    cancel: &CancellationToken,
) -> Result<(), Failure> {
    let config = args.gc_config().map_err(Failure::config)?;
    let client = create_client(kubeconfig).await.map_err(Failure::client)?;
    let store: Arc<dyn SigningRequestStore> = Arc::new(KubeSigningRequestStore::new(client));
    let gc = GarbageCollector::new(store, config).map_err(Failure::config)?;

    if args.daemon {
        gc.garbage_collect_loop(cancel)
            .await
            .map_err(Failure::operation)
    } else {
        gc.garbage_collect()
            .await
            .map(|_| ())
            .map_err(Failure::operation)
    }
}
