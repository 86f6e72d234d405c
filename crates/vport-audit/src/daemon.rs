//! Long-running audit daemon loop.

use std::path::PathBuf;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::error::{AuditError, AuditResult};
use crate::reconciler::Reconciler;
use crate::switch::SwitchControlPlane;
use crate::traits::{ControlPlane, DeletionNotifier, WorkloadInventory};

/// How long to wait between attempts to reach the vswitch database socket.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Audit daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the OVSDB unix socket.
    pub endpoint: PathBuf,
    /// Bridge our ports attach to.
    pub bridge: String,
    /// Port-name prefix marking plugin-owned state.
    pub owned_prefix: String,
    /// Seconds between reconciliation cycles.
    pub monitor_interval: u64,
    /// Seconds between connection liveness probes.
    pub connection_check_interval: u64,
    /// Seconds an entry must stay stale before it is deleted.
    pub stale_entry_timeout: i64,
}

struct Signals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl Signals {
    fn install() -> AuditResult<Self> {
        let install =
            |kind: SignalKind| signal(kind).map_err(|source| AuditError::Signal { source });
        Ok(Signals {
            hangup: install(SignalKind::hangup())?,
            interrupt: install(SignalKind::interrupt())?,
            terminate: install(SignalKind::terminate())?,
            quit: install(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.hangup.recv() => {}
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
            _ = self.quit.recv() => {}
        }
    }
}

/// Runs the audit daemon until a termination signal arrives. The vswitch
/// may come up after us, so the initial connection retries indefinitely at
/// a fixed delay; only a signal gets us out.
pub async fn run<I, N>(config: DaemonConfig, inventory: I, notifier: N) -> AuditResult<()>
where
    I: WorkloadInventory,
    N: DeletionNotifier,
{
    let mut signals = Signals::install()?;
    let mut reconciler = Reconciler::new(&config.owned_prefix, config.stale_entry_timeout);

    let mut switch = connect_with_retry(&config, &mut signals).await?;
    info!(endpoint = %config.endpoint.display(), "Audit daemon connected to vswitch");

    // The first tick of each interval fires immediately, so a cleanup pass
    // runs as soon as the connection is up.
    let mut monitor = interval(Duration::from_secs(config.monitor_interval.max(1)));
    let mut connection_check =
        interval(Duration::from_secs(config.connection_check_interval.max(1)));

    loop {
        tokio::select! {
            _ = monitor.tick() => {
                match reconciler.run_cycle(&switch, &inventory, &notifier).await {
                    Ok(report) => {
                        if report.stale_entities > 0 || report.stale_ports > 0 {
                            info!(
                                stale_entities = report.stale_entities,
                                stale_ports = report.stale_ports,
                                deleted_entities = report.deleted_entities.len(),
                                deleted_ports = report.deleted_ports.len(),
                                "Reconciliation cycle complete"
                            );
                        }
                    }
                    Err(e) => error!("Reconciliation cycle failed: {e}"),
                }
            }
            _ = connection_check.tick() => {
                if let Err(e) = switch.probe().await {
                    warn!("Lost vswitch connection, reconnecting: {e}");
                    // One attempt per tick; the next tick retries if the
                    // vswitch is still down.
                    match SwitchControlPlane::connect(&config.endpoint, &config.bridge).await {
                        Ok(fresh) => {
                            info!("Reconnected to vswitch");
                            switch = fresh;
                        }
                        Err(e) => error!("Reconnect failed: {e}"),
                    }
                }
            }
            _ = signals.recv() => {
                info!("Audit daemon received termination signal, exiting");
                return Err(AuditError::Interrupted);
            }
        }
    }
}

async fn connect_with_retry(
    config: &DaemonConfig,
    signals: &mut Signals,
) -> AuditResult<SwitchControlPlane> {
    loop {
        match SwitchControlPlane::connect(&config.endpoint, &config.bridge).await {
            Ok(switch) => return Ok(switch),
            Err(e) => {
                warn!(
                    endpoint = %config.endpoint.display(),
                    "Vswitch not reachable, retrying in {}s: {e}",
                    CONNECT_RETRY_DELAY.as_secs()
                );
            }
        }
        tokio::select! {
            _ = sleep(CONNECT_RETRY_DELAY) => {}
            _ = signals.recv() => return Err(AuditError::Interrupted),
        }
    }
}
