mod config;

use clap::Parser;
use socket_patch_core::{BackupVerification, PatchEngine, PatchError};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let cache_dir = config.effective_cache_dir();
    info!("Project: {}", config.cwd.display());
    info!("Backups: {}", cache_dir.display());

    let engine = PatchEngine::new(&cache_dir, config.lock_options());

    let result = tokio::select! {
        result = run(&config, &engine) => result,
        _ = shutdown_signal() => {
            engine.lock_manager().release_all();
            anyhow::bail!("Interrupted");
        }
    };

    if let Err(e) = &result {
        if e
            .downcast_ref::<PatchError>()
            .is_some_and(PatchError::is_lock_contention)
        {
            warn!(
                "Another socket-patch process is working on {}; retry once it finishes",
                config.cwd.display()
            );
        }
    }
    result
}

async fn run(config: &Config, engine: &PatchEngine) -> anyhow::Result<()> {
    let cwd = config.cwd.as_path();

    match &config.command {
        Command::Status => {
            let patches = engine.status(cwd).await?;
            if patches.is_empty() {
                println!("No patches recorded");
            }
            for patch in patches {
                println!(
                    "{}  {}  {}  ({} files, {} backed up)",
                    patch.package_id,
                    patch.uuid,
                    patch.status,
                    patch.patched_files,
                    patch.backed_up_files
                );
            }
        }
        Command::Rollback { package_id } => {
            let outcome = engine.rollback(cwd, package_id.as_deref()).await?;
            println!("{}", outcome);
            if !outcome.is_complete() {
                anyhow::bail!("Rollback incomplete; backups were kept for a retry");
            }
        }
        Command::Verify { uuid } => {
            let Some(paths) = engine.backups().list_backups(uuid).await? else {
                anyhow::bail!("No backups recorded for {}", uuid);
            };

            let mut damaged = 0usize;
            for path in &paths {
                let verification = engine.backups().verify_backup(uuid, path).await?;
                if verification != BackupVerification::Intact {
                    damaged += 1;
                }
                println!("{}  {:?}", path.display(), verification);
            }
            if damaged > 0 {
                anyhow::bail!("{} of {} backups are damaged", damaged, paths.len());
            }
        }
        Command::Validate => {
            if !engine.manifests().validate_manifest(cwd).await {
                anyhow::bail!("Manifest in {} is invalid", cwd.display());
            }
            println!("Manifest is valid");
        }
        Command::Cleanup { uuid } => {
            if engine.backups().cleanup_backups(uuid).await? {
                println!("Removed backups for {}", uuid);
            } else {
                println!("No backups recorded for {}", uuid);
            }
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, releasing locks"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, releasing locks");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
