//! Daemon wiring: broker process, privilege drop, scheduler and adapter links.

use std::os::unix::fs::chown;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use cachefs_broker::{Authorizer, BROKER_SOCKET_MODE, BrokerClient, BrokerOps, BrokerServer};
use cachefs_channel::CredentialListener;
use cachefs_protocol::CacheLayout;
use cachefs_remote::S3Remote;
use cachefs_store::TransferStore;
use cachefs_transfer::{AdapterLink, TransferContext, TransferError, TransferScheduler};
use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BrokerArgs;
use crate::config::DaemonConfig;

/// How long to wait for the broker socket to appear.
const BROKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between attempts to reach the adapter.
const ADAPTER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Runs the scheduler until Ctrl-C or until the broker dies.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    config.validate()?;
    let layout = config.layout();
    prepare_cache_tree(&config, &layout)?;

    let mut broker = spawn_broker(&config)?;
    wait_for_broker(&config.broker_socket, &mut broker).await?;
    // Connect while still privileged; the link stays usable after the drop.
    let broker_client = BrokerClient::connect(&config.broker_socket)
        .await
        .context("connecting to broker")?;
    drop_privileges(&config)?;

    let store = TransferStore::open(config.database_path())
        .await
        .context("opening transfer store")?;
    let reset = store.reset_in_progress().await?;
    let purged = store.purge_downloads().await?;
    info!(reset_parts = reset, purged_downloads = purged, "transfer store recovered");

    let ctx = Arc::new(TransferContext {
        store: Arc::new(store),
        remote: Arc::new(S3Remote::new(&config.s3_config())),
        broker: Arc::new(broker_client),
        layout,
        chunk_size: config.chunk_size,
    });
    let scheduler = TransferScheduler::new(ctx, config.worker_slots);
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(scheduler.clone().run(cancel.clone())));
    for link in 0..config.worker_slots {
        let scheduler = scheduler.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            maintain_adapter_link(link, &config, scheduler, cancel).await;
        }));
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
        status = broker.wait() => {
            error!(?status, "broker exited");
            Err(anyhow::anyhow!("broker exited unexpectedly"))
        }
    };

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {e}");
        }
    }
    info!("cachefsd stopped");
    result
}

/// Runs the privilege broker until Ctrl-C.
pub async fn run_broker(args: BrokerArgs) -> anyhow::Result<()> {
    let layout = CacheLayout::new(&args.cache_dir);
    let listener = CredentialListener::bind(&args.socket, BROKER_SOCKET_MODE)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    let server = BrokerServer::new(
        listener,
        Authorizer::new(args.authorized_pid),
        BrokerOps::new(layout, args.chunk_size),
    );

    let cancel = CancellationToken::new();
    let mut task = tokio::spawn(server.run(cancel.clone()));
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut task => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            cancel.cancel();
            task.await
        }
    };
    result??;
    Ok(())
}

/// Creates the cache root and the staging area, owned by the identity the
/// scheduler will run as.
fn prepare_cache_tree(config: &DaemonConfig, layout: &CacheLayout) -> anyhow::Result<()> {
    std::fs::create_dir_all(layout.inprogress_root())
        .with_context(|| format!("creating {}", layout.inprogress_root().display()))?;
    if let Some(parent) = config.broker_socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let (Some(uid), Some(gid)) = (config.run_as_uid, config.run_as_gid) {
        if Uid::effective().is_root() {
            for path in [layout.cache_root(), layout.inprogress_root()] {
                chown(path, Some(uid), Some(gid))
                    .with_context(|| format!("chown {}", path.display()))?;
            }
        }
    }
    Ok(())
}

fn spawn_broker(config: &DaemonConfig) -> anyhow::Result<Child> {
    match std::fs::remove_file(&config.broker_socket) {
        Ok(()) => debug!(socket = %config.broker_socket.display(), "removed stale broker socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let exe = std::env::current_exe().context("locating own executable")?;
    let child = Command::new(exe)
        .arg("broker")
        .arg("--socket")
        .arg(&config.broker_socket)
        .arg("--authorized-pid")
        .arg(std::process::id().to_string())
        .arg("--cache-dir")
        .arg(&config.cache_dir)
        .arg("--chunk-size")
        .arg(config.chunk_size.to_string())
        .kill_on_drop(true)
        .spawn()
        .context("spawning broker")?;
    info!(pid = child.id(), "broker spawned");
    Ok(child)
}

async fn wait_for_broker(socket: &Path, broker: &mut Child) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + BROKER_STARTUP_TIMEOUT;
    while !socket.exists() {
        if let Some(status) = broker.try_wait()? {
            bail!("broker exited during startup: {status}");
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("broker socket {} did not appear", socket.display());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn drop_privileges(config: &DaemonConfig) -> anyhow::Result<()> {
    let (Some(uid), Some(gid)) = (config.run_as_uid, config.run_as_gid) else {
        return Ok(());
    };
    if !Uid::effective().is_root() {
        warn!(uid, gid, "not running as root, keeping current identity");
        return Ok(());
    }

    let gid = Gid::from_raw(gid);
    setgroups(&[gid]).context("setgroups")?;
    setgid(gid).context("setgid")?;
    setuid(Uid::from_raw(uid)).context("setuid")?;
    info!(uid, gid = gid.as_raw(), "privileges dropped");
    Ok(())
}

/// Keeps one link to the adapter open, reconnecting after failures.
async fn maintain_adapter_link(
    link: usize,
    config: &DaemonConfig,
    scheduler: Arc<TransferScheduler>,
    cancel: CancellationToken,
) {
    let request = config.connect_request();
    while !cancel.is_cancelled() {
        match AdapterLink::connect(&config.adapter_socket, &request, scheduler.clone()).await {
            Ok(adapter) => {
                debug!(link, "adapter link serving");
                if let Err(e) = adapter.serve(cancel.clone()).await {
                    warn!(link, "adapter link failed: {e}");
                }
            }
            Err(TransferError::Refused(reason)) => {
                error!(link, %reason, "adapter refused link");
            }
            Err(e) => debug!(link, "adapter not reachable: {e}"),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ADAPTER_RETRY_DELAY) => {}
        }
    }
}
