//! `relay run` and `relay build`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::process::CommandLauncher;
use relay_core::watch::NotifyWatcher;
use relay_core::{Builder, Harness, render, server};

use crate::builder::CommandBuilder;
use crate::config::RelayConfig;

/// Upper bound on waiting for the refresh lock when stopping.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn command_builder(config: &RelayConfig) -> CommandBuilder {
    CommandBuilder::new(
        &config.project,
        &config.build.command,
        config.build.args.clone(),
        &config.build.output,
    )
    .with_link(config.build.link.clone())
}

/// Run the app, through the harness unless watching is disabled.
///
/// Returns the exit code the process should end with.
pub async fn run(config: RelayConfig) -> Result<i32> {
    info!(
        app = %config.app_name,
        import_path = %config.launch.import_path,
        mode = %config.launch.run_mode,
        project = %config.project.display(),
        "running"
    );
    if config.watch.enabled {
        run_watched(&config).await.map(|()| 0)
    } else {
        run_live(&config).await
    }
}

/// Serve through the harness until interrupted or a fatal error.
pub async fn run_watched(config: &RelayConfig) -> Result<()> {
    info!("running in watched mode");
    let watcher = NotifyWatcher::new(
        &config.watch.roots,
        config.watch.filter.clone(),
        config.watch.debounce,
    )?;
    let harness = Arc::new(
        Harness::new(
            config.harness.clone(),
            Arc::new(watcher),
            Arc::new(command_builder(config)),
            Arc::new(CommandLauncher::new(config.launch.clone())),
        )
        .context("failed to set up harness")?,
    );
    info!(backend = %harness.backend().authority(), "proxying to app");

    let shutdown = CancellationToken::new();
    let fatal = harness.fatal_signal();
    let result = tokio::select! {
        res = server::serve(Arc::clone(&harness), shutdown.clone()) => res,
        () = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
        () = fatal.cancelled() => Err(anyhow!("harness stopped after the builder panicked")),
    };
    shutdown.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, harness.shutdown())
        .await
        .is_err()
    {
        warn!("timed out waiting to stop the app");
    }
    result
}

/// Build once and run the app in the foreground on the listen port.
pub async fn run_live(config: &RelayConfig) -> Result<i32> {
    info!("running in live build mode");
    let artifact = command_builder(config)
        .build(&config.harness.build_flags)
        .await
        .map_err(|e| anyhow!("failed to build app: {e}"))?;

    let status = CommandLauncher::new(config.launch.clone())
        .run(&artifact, config.harness.listen_port)
        .await
        .with_context(|| format!("failed to run {}", artifact.executable_path.display()))?;
    info!(%status, "app exited");
    Ok(status.code().unwrap_or(1))
}

/// Build once and print the artifact path.
pub async fn build(config: &RelayConfig) -> Result<()> {
    match command_builder(config)
        .build(&config.harness.build_flags)
        .await
    {
        Ok(artifact) => {
            println!("{}", artifact.executable_path.display());
            Ok(())
        }
        Err(err) => {
            eprint!("{}", render::text(&err));
            bail!("build failed");
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
