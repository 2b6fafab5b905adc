/*! The systemd D-Bus API surface used by the activation engine: unit
listing, parallel job fan-out, daemon reload, and pid1 re-execution.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::StreamExt;
use zbus::{proxy, zvariant::OwnedObjectPath, Connection};

/// The `ListUnits` wire tuple.
type RawUnit = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
trait Manager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn list_units(&self) -> zbus::Result<Vec<RawUnit>>;

    fn reload(&self) -> zbus::Result<()>;

    fn reexecute(&self) -> zbus::Result<()>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: &str,
        result: &str,
    ) -> zbus::Result<()>;
}

/// A unit systemd currently considers worth acting on: its state is not
/// `inactive` and it does not merely follow another unit.
#[derive(Debug, Clone)]
pub struct ActiveUnit {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
}

impl ActiveUnit {
    pub fn is_active_or_activating(&self) -> bool {
        matches!(self.active_state.as_str(), "active" | "activating")
    }
}

/// The bus method enacted on every unit of one executor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum UnitJob {
    Start,
    Stop,
    Restart,
    Reload,
}

/// Completion status of one systemd job, as reported by `JobRemoved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
}

/// The result of one unit's job within a phase fan-out.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub unit: String,
    pub job: UnitJob,
    pub result: JobResult,
}

impl JobOutcome {
    /// Only `failed` and `timeout` are surfaced to the operator.
    pub fn is_failure(&self) -> bool {
        matches!(self.result, JobResult::Failed | JobResult::Timeout)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("Connecting to the system D-Bus")]
    Connect(#[source] zbus::Error),
    #[error("Creating the systemd manager proxy")]
    Proxy(#[source] zbus::Error),
    #[error("Listing systemd units")]
    ListUnits(#[source] zbus::Error),
    #[error("Subscribing to systemd job signals")]
    Subscribe(#[source] zbus::Error),
    #[error("Reading the job-completion signal stream")]
    JobStream(#[source] zbus::Error),
    #[error("The job-completion signal stream ended with jobs still pending")]
    JobStreamEnded,
    #[error("Reloading the systemd daemon")]
    DaemonReload(#[source] zbus::Error),
    #[error("Joining spawned async task")]
    Join(
        #[source]
        #[from]
        tokio::task::JoinError,
    ),
}

/// A connection to pid 1's manager object.
pub struct SystemdBus {
    connection: Connection,
}

impl SystemdBus {
    #[tracing::instrument(skip_all)]
    pub async fn connect() -> Result<Self, BusError> {
        let connection = Connection::system().await.map_err(BusError::Connect)?;
        Ok(Self { connection })
    }

    async fn manager(&self) -> Result<ManagerProxy<'_>, BusError> {
        ManagerProxy::new(&self.connection)
            .await
            .map_err(BusError::Proxy)
    }

    /// Every unit systemd reports as active, keyed by name. Units whose
    /// state is `inactive` or which follow another unit are dropped.
    #[tracing::instrument(skip_all)]
    pub async fn active_units(&self) -> Result<BTreeMap<String, ActiveUnit>, BusError> {
        let manager = self.manager().await?;
        let raw = manager.list_units().await.map_err(BusError::ListUnits)?;
        let mut units = BTreeMap::new();
        for (name, _description, _load_state, active_state, sub_state, followed, ..) in raw {
            if active_state == "inactive" || !followed.is_empty() {
                continue;
            }
            units.insert(
                name.clone(),
                ActiveUnit {
                    name,
                    active_state,
                    sub_state,
                },
            );
        }
        Ok(units)
    }

    /// Dispatch `job` for every unit in `units` (mode `"replace"`) and wait
    /// for all of the resulting jobs to complete. Dispatch failures are
    /// recorded as `failed` outcomes rather than aborting the phase.
    #[tracing::instrument(skip_all, fields(job = %job, units = units.len()))]
    pub async fn run_jobs(
        &self,
        job: UnitJob,
        units: &BTreeSet<String>,
    ) -> Result<Vec<JobOutcome>, BusError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let manager = self.manager().await?;
        manager.subscribe().await.map_err(BusError::Subscribe)?;
        // The stream must exist before the first dispatch, or a fast job's
        // completion signal is lost.
        let mut removals = manager
            .receive_job_removed()
            .await
            .map_err(BusError::JobStream)?;

        let mut outcomes = Vec::with_capacity(units.len());
        let mut pending: HashMap<OwnedObjectPath, String> = HashMap::new();

        let mut dispatches = tokio::task::JoinSet::new();
        for unit in units {
            let connection = self.connection.clone();
            let unit = unit.clone();
            dispatches.spawn(async move {
                let queued: zbus::Result<OwnedObjectPath> = async {
                    let manager = ManagerProxy::new(&connection).await?;
                    match job {
                        UnitJob::Start => manager.start_unit(&unit, "replace").await,
                        UnitJob::Stop => manager.stop_unit(&unit, "replace").await,
                        UnitJob::Restart => manager.restart_unit(&unit, "replace").await,
                        UnitJob::Reload => manager.reload_unit(&unit, "replace").await,
                    }
                }
                .await;
                (unit, queued)
            });
        }
        while let Some(joined) = dispatches.join_next().await {
            let (unit, queued) = joined?;
            match queued {
                Ok(job_path) => {
                    pending.insert(job_path, unit);
                },
                Err(e) => {
                    tracing::warn!(unit = %unit, "Failed to dispatch {job}: {e}");
                    outcomes.push(JobOutcome {
                        unit,
                        job,
                        result: JobResult::Failed,
                    });
                },
            }
        }

        while !pending.is_empty() {
            let signal = removals.next().await.ok_or(BusError::JobStreamEnded)?;
            let args = signal.args().map_err(BusError::JobStream)?;
            if let Some(unit) = pending.remove(&args.job) {
                let result = args
                    .result
                    .parse::<JobResult>()
                    .unwrap_or(JobResult::Failed);
                tracing::debug!(unit = %unit, result = %result, "Job finished");
                outcomes.push(JobOutcome { unit, job, result });
            }
        }

        Ok(outcomes)
    }

    #[tracing::instrument(skip_all)]
    pub async fn daemon_reload(&self) -> Result<(), BusError> {
        let manager = self.manager().await?;
        manager.reload().await.map_err(BusError::DaemonReload)
    }

    /// Ask pid 1 to re-execute itself. The reply may never arrive because
    /// the manager is replacing its own image, so errors are swallowed.
    #[tracing::instrument(skip_all)]
    pub async fn reexecute(&self) {
        match self.manager().await {
            Ok(manager) => {
                if let Err(e) = manager.reexecute().await {
                    tracing::debug!("Ignoring reply error from pid 1 re-exec: {e}");
                }
            },
            Err(e) => {
                tracing::debug!("Ignoring proxy error during pid 1 re-exec: {e}");
            },
        }
    }
}
