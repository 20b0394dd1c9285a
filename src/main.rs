use std::sync::Arc;

use clap::Parser;
use revisionfs::config::{Cli, Config};
use revisionfs::dispatcher::RevisionFs;
use revisionfs::engine::Engine;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("revisionfs: {e}");
            std::process::exit(1);
        }
    };

    let log_file = tracing_appender::rolling::never(
        config.backing_root.clone(),
        config.log_path().file_name().expect("log path always has a file name"),
    );
    let (writer, _guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    tracing::info!(backing_root = %config.backing_root.display(), mount_point = %config.mount_point.display(), "starting revisionfs");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(config.backing_root.clone(), config.clone_command.clone()));
    let fs = RevisionFs::new(engine, runtime.handle().clone());

    let options = vec![fuser::MountOption::FSName("revisionfs".to_string()), fuser::MountOption::DefaultPermissions];

    if let Err(e) = fuser::mount2(fs, &config.mount_point, &options) {
        tracing::error!(error = %e, "mount failed");
        std::process::exit(1);
    }
}
