use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use nipbr_lib::config;
use nipbr_lib::logging::{self, LogReloadHandle};

use crate::routing::{KernelRouter, NetlinkRouter, RouteChange};

mod cli;
mod core;
mod routing;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn ctrlc_channel() -> Result<mpsc::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigint: receiver closed");
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigterm: receiver closed");
                        break;
                    }
                },
                else => {
                    tracing::warn!("sigint and sigterm streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn hangup_channel() -> Result<mpsc::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(4);
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            tracing::debug!("received SIGHUP");
            if sender.send(()).await.is_err() {
                tracing::warn!("sighup: receiver closed");
                break;
            }
        }
    });

    Ok(receiver)
}

async fn config_channel(
    config_path: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Event>), exitcode::ExitCode> {
    let parent = match config_path.parent() {
        Some(p) => p,
        None => {
            tracing::error!("config path has no parent");
            return Err(exitcode::UNAVAILABLE);
        }
    };

    let (sender, receiver) = mpsc::channel(32);
    let mut watcher = match notify::recommended_watcher(move |res| match res {
        Ok(event) => {
            let _ = sender.blocking_send(event).map_err(|e| {
                tracing::error!(error = ?e, "error sending config watch event");
            });
        }
        Err(e) => tracing::error!(error = ?e, "config watch error"),
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = ?e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };

    // watch the directory to survive editors replacing the file
    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        tracing::error!(error = ?e, "error watching config directory");
        return Err(exitcode::IOERR);
    }

    Ok((watcher, receiver))
}

// handling fs config events with a grace period to avoid duplicate reads without delay
const CONFIG_GRACE_PERIOD: Duration = Duration::from_millis(333);

fn incoming_config_fs_event(event: notify::Event, config_path: &Path) -> bool {
    tracing::debug!(?event, ?config_path, "incoming config event");
    if !event.paths.iter().any(|p| p.file_name() == config_path.file_name()) {
        return false;
    }
    match event.kind {
        kind @ notify::event::EventKind::Create(notify::event::CreateKind::File)
        | kind @ notify::event::EventKind::Remove(notify::event::RemoveKind::File)
        | kind @ notify::event::EventKind::Modify(notify::event::ModifyKind::Data(_)) => {
            tracing::debug!(?kind, "config file change detected");
            true
        }
        _ => false,
    }
}

fn reopen_log(log_reload: &Option<(LogReloadHandle, PathBuf)>) {
    match log_reload {
        Some((handle, path)) => {
            if let Err(error) = logging::reopen_log_file(handle, path) {
                tracing::error!(%error, log_file = %path.display(), "failed to reopen log file");
            }
        }
        None => tracing::debug!("logging to stdout, nothing to reopen"),
    }
}

async fn daemon(args: cli::Cli, log_reload: Option<(LogReloadHandle, PathBuf)>) -> Result<(), exitcode::ExitCode> {
    match args.config_path.try_exists() {
        Ok(true) => (),
        Ok(false) => {
            tracing::error!(config_file = %args.config_path.display(), "cannot find configuration file");
            return Err(exitcode::NOINPUT);
        }
        Err(e) => {
            tracing::error!(error = ?e, "error checking configuration file path");
            return Err(exitcode::IOERR);
        }
    };
    let config_path = match fs::canonicalize(&args.config_path) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };

    let mut ctrlc_receiver = ctrlc_channel().await?;
    let mut hangup_receiver = hangup_channel().await?;

    // keep config watcher in scope so it does not get dropped
    let (_config_watcher, mut config_receiver) = config_channel(&config_path).await?;

    let config = config::read(&config_path).await.map_err(|e| {
        tracing::error!(error = %e, "failed to read configuration");
        exitcode::CONFIG
    })?;

    let kernel = NetlinkRouter::connect().map_err(|e| {
        tracing::error!(error = %e, "failed to open netlink connection");
        exitcode::OSERR
    })?;

    // subscribe before syncing so no route change gets lost in between
    let mut route_changes = kernel.route_changes().await.map_err(|e| {
        tracing::error!(error = %e, "failed to subscribe to route changes");
        exitcode::OSERR
    })?;

    let mut core = core::Core::start(kernel, config).await.map_err(|e| {
        tracing::error!(error = %e, "failed to initialize routing");
        exitcode::OSERR
    })?;

    tracing::info!("enter listening mode");
    let res = loop_daemon(
        &mut core,
        &mut ctrlc_receiver,
        &mut hangup_receiver,
        &mut config_receiver,
        &mut route_changes,
        &config_path,
        &log_reload,
    )
    .await;

    tokio::select! {
        _ = core.shutdown() => tracing::info!("shutdown complete"),
        Some(_) = ctrlc_receiver.recv() => tracing::info!("force shutdown immediately"),
    }
    res
}

async fn loop_daemon<K: KernelRouter>(
    core: &mut core::Core<K>,
    ctrlc_receiver: &mut mpsc::Receiver<()>,
    hangup_receiver: &mut mpsc::Receiver<()>,
    config_receiver: &mut mpsc::Receiver<notify::Event>,
    route_changes: &mut mpsc::UnboundedReceiver<RouteChange>,
    config_path: &Path,
    log_reload: &Option<(LogReloadHandle, PathBuf)>,
) -> Result<(), exitcode::ExitCode> {
    let (reload_sender, mut reload_receiver) = mpsc::channel(1);
    let mut reload_cancel = CancellationToken::new();

    loop {
        tokio::select! {
            Some(_) = ctrlc_receiver.recv() => {
                tracing::info!("initiate shutdown");
                return Ok(());
            },
            Some(_) = hangup_receiver.recv() => reopen_log(log_reload),
            change = route_changes.recv() => match change {
                Some(change) => core.handle_route_change(&change).await,
                None => {
                    tracing::error!("route change monitor closed");
                    return Err(exitcode::IOERR);
                }
            },
            Some(evt) = config_receiver.recv() => {
                if incoming_config_fs_event(evt, config_path) {
                    reload_cancel.cancel();
                    reload_cancel = CancellationToken::new();
                    let cancel_token = reload_cancel.clone();
                    let sender = reload_sender.clone();
                    tokio::spawn(async move {
                        cancel_token.run_until_cancelled(async move {
                            sleep(CONFIG_GRACE_PERIOD).await;
                            if sender.send(()).await.is_err() {
                                tracing::warn!("reload receiver already closed");
                            }
                        }).await;
                    });
                }
            },
            Some(_) = reload_receiver.recv() => {
                match config::read(config_path).await {
                    Ok(config) => core.reload(config).await,
                    Err(error) => {
                        tracing::error!(%error, "failed to read configuration, keeping current one");
                    }
                }
            },
            else => {
                tracing::error!("unexpected channel closure");
                return Err(exitcode::IOERR);
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();

    let log_reload = match args.log_file.clone() {
        Some(path) => match logging::setup_log_file(&path) {
            Ok(handle) => Some((handle, path)),
            Err(e) => {
                eprintln!("unable to open log file {}: {e}", path.display());
                process::exit(exitcode::CANTCREAT);
            }
        },
        None => {
            logging::setup_stdout();
            None
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args, log_reload).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use notify::event::{CreateKind, DataChange, EventKind, ModifyKind, RemoveKind};

    use std::net::{IpAddr, Ipv4Addr};

    use crate::routing::mocks::MockKernelRouter;
    use crate::routing::netlink_ops::{LinkKind, MAIN_TABLE, RouteChangeKind, RouteSpec};

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn config_writes_trigger_reload() {
        let config_path = Path::new("/etc/nipbr/config.toml");

        assert!(incoming_config_fs_event(
            event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/etc/nipbr/config.toml"),
            config_path
        ));
        assert!(incoming_config_fs_event(
            event(EventKind::Create(CreateKind::File), "/etc/nipbr/config.toml"),
            config_path
        ));
        assert!(incoming_config_fs_event(
            event(EventKind::Remove(RemoveKind::File), "/etc/nipbr/config.toml"),
            config_path
        ));
    }

    #[test]
    fn other_files_in_config_directory_are_ignored() {
        let config_path = Path::new("/etc/nipbr/config.toml");

        assert!(!incoming_config_fs_event(
            event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/etc/nipbr/.config.toml.swp"),
            config_path
        ));
    }

    #[test]
    fn metadata_changes_are_ignored() {
        let config_path = Path::new("/etc/nipbr/config.toml");

        assert!(!incoming_config_fs_event(
            event(
                EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
                "/etc/nipbr/config.toml"
            ),
            config_path
        ));
    }

    #[tokio::test]
    async fn route_changes_are_mirrored_until_monitor_closes() -> anyhow::Result<()> {
        let kernel = MockKernelRouter::new()
            .with_link(2, "eth0", LinkKind::Other)
            .with_link(5, "bn1", LinkKind::Bridge)
            .with_link(9, "pbr-dummy", LinkKind::Other);
        let config = config::parse(
            r#"
version = 1

[[ports]]
name = "eth0"

[network_instances.local1]
bridge = "bn1"
uplink = "eth0"
"#,
        )?;

        let mut route_changes = kernel.route_changes().await?;
        let mut core = crate::core::Core::start(kernel.clone(), config).await?;
        let (_ctrlc_sender, mut ctrlc_receiver) = mpsc::channel(1);
        let (_hangup_sender, mut hangup_receiver) = mpsc::channel(1);
        let (_config_sender, mut config_receiver) = mpsc::channel(1);

        let added = RouteSpec {
            if_index: Some(2),
            ..RouteSpec::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 0)), 12, MAIN_TABLE)
        };
        kernel.emit(RouteChange {
            kind: RouteChangeKind::New,
            route: added.clone(),
        });
        kernel.close_route_changes();

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            loop_daemon(
                &mut core,
                &mut ctrlc_receiver,
                &mut hangup_receiver,
                &mut config_receiver,
                &mut route_changes,
                Path::new("/etc/nipbr/config.toml"),
                &None,
            ),
        )
        .await?;

        assert_eq!(res, Err(exitcode::IOERR));
        assert!(kernel.routes_in_table(505).contains(&added.mirrored_into(505)));
        Ok(())
    }

    #[tokio::test]
    async fn config_channel_reports_writes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "version = 1\n")?;

        let (_watcher, mut receiver) = config_channel(&path).await.map_err(|code| anyhow::anyhow!("exit {code}"))?;
        std::fs::write(&path, "version = 1\n[routing]\n")?;

        let evt = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await?;
        assert!(evt.is_some());
        Ok(())
    }
}
