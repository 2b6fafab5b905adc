/*! The unit diff engine: reduce the current/new unit trees plus the live
unit state to one verdict per unit.
*/

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::activate::fstab::MountChanges;
use crate::activate::lists::{self, ListFiles};
use crate::activate::plan::Plan;
use crate::systemd::bus::ActiveUnit;
use crate::systemd::unit_file::{load_unit, UnitInfo};
use crate::systemd::{mount_point_of, unit_basename, UnitFilePaths, SYSTEM_UNITS_DIR};
use crate::SwitchError;

/// Unit-section keys whose change alone never warrants a restart.
pub static IGNORED_UNIT_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "X-Reload-Triggers",
        "Description",
        "Documentation",
        "OnFailure",
        "OnSuccess",
        "IgnoreOnIsolate",
        "OnFailureJobMode",
        "StopWhenUnneeded",
        "RefuseManualStart",
        "RefuseManualStop",
        "AllowIsolate",
        "CollectMode",
        "SourcePath",
    ]
    .into_iter()
    .collect()
});

/// Targets that must not be started manually after a resume cycle.
const SLEEP_TARGETS: &[&str] = &[
    "suspend.target",
    "hibernate.target",
    "hybrid-sleep.target",
];

/// Targets that everything hangs off of; cycling them would cycle the
/// world.
const NEVER_CYCLED_TARGETS: &[&str] = &[
    "sysinit.target",
    "basic.target",
    "multi-user.target",
    "graphical.target",
];

/// Verdict of comparing two versions of one unit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitComparison {
    Equal,
    NeedsReload,
    NeedsRestart,
}

enum KeyException {
    Reload,
    Ignore,
}

fn key_exception(section: &str, key: &str) -> Option<KeyException> {
    match (section, key) {
        ("Unit", "X-Reload-Triggers") => Some(KeyException::Reload),
        ("Unit", key) if IGNORED_UNIT_KEYS.contains(key) => Some(KeyException::Ignore),
        ("Mount", "Options") => Some(KeyException::Reload),
        _ => None,
    }
}

/// Compare two unit files key by key.
pub fn compare_unit_files(cur: &UnitInfo, new: &UnitInfo) -> UnitComparison {
    let mut result = UnitComparison::Equal;

    for (section, keys) in cur.sections() {
        match new.section(section) {
            None => {
                if section == "Unit"
                    && keys.keys().all(|key| IGNORED_UNIT_KEYS.contains(key.as_str()))
                {
                    continue;
                }
                return UnitComparison::NeedsRestart;
            },
            Some(_) => {
                for (key, values) in keys {
                    if new.multi(section, key) == values.as_slice() {
                        continue;
                    }
                    match key_exception(section, key) {
                        Some(KeyException::Reload) => result = UnitComparison::NeedsReload,
                        Some(KeyException::Ignore) => (),
                        None => return UnitComparison::NeedsRestart,
                    }
                }
            },
        }
    }

    // Keys and sections only present in the new unit.
    for (section, keys) in new.sections() {
        match cur.section(section) {
            None => {
                if section == "Unit"
                    && keys.keys().all(|key| IGNORED_UNIT_KEYS.contains(key.as_str()))
                {
                    continue;
                }
                return UnitComparison::NeedsRestart;
            },
            Some(cur_keys) => {
                for key in keys.keys() {
                    if cur_keys.contains_key(key) {
                        continue;
                    }
                    match key_exception(section, key) {
                        Some(KeyException::Reload) => result = UnitComparison::NeedsReload,
                        Some(KeyException::Ignore) => (),
                        None => return UnitComparison::NeedsRestart,
                    }
                }
            },
        }
    }

    result
}

/// Whether a modified unit is classified before or after the activation
/// script has run. Post-script, services use `restart` instead of
/// stop-then-start, and socket-activated services are left for their
/// sockets to wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyPhase {
    PreActivation,
    PostActivation,
}

/// Builds the [`Plan`] for one activation, mirroring every addition to the
/// on-disk list files as it goes.
pub struct UnitDiffer<'a> {
    current_units_dir: PathBuf,
    new_units_dir: PathBuf,
    active: &'a BTreeMap<String, ActiveUnit>,
    lists: &'a ListFiles,
    display_all_units: bool,
    plan: Plan,
}

impl<'a> UnitDiffer<'a> {
    pub fn new(
        current_units_dir: impl Into<PathBuf>,
        new_toplevel: &Path,
        active: &'a BTreeMap<String, ActiveUnit>,
        lists: &'a ListFiles,
        display_all_units: bool,
    ) -> Self {
        let mut plan = Plan::default();
        // A previous failed activation may have left verdicts behind;
        // consolidate them rather than losing them.
        plan.start.extend(lists.read(lists::START_LIST));
        plan.restart.extend(lists.read(lists::RESTART_LIST));
        for unit in lists.read(lists::RELOAD_LIST) {
            if !plan.restart.contains(&unit) {
                plan.reload.insert(unit);
            }
        }

        Self {
            current_units_dir: current_units_dir.into(),
            new_units_dir: new_toplevel.join(SYSTEM_UNITS_DIR),
            active,
            lists,
            display_all_units,
            plan,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }

    /// One verdict per active unit.
    #[tracing::instrument(skip_all)]
    pub async fn plan_units(&mut self) -> Result<(), SwitchError> {
        let units: Vec<ActiveUnit> = self.active.values().cloned().collect();
        for unit in units {
            self.classify_active_unit(&unit).await?;
        }
        Ok(())
    }

    async fn classify_active_unit(&mut self, unit: &ActiveUnit) -> Result<(), SwitchError> {
        let name = unit.name.as_str();
        let current = UnitFilePaths::resolve(&self.current_units_dir, name);
        let new = UnitFilePaths::resolve(&self.new_units_dir, name);

        // Units we do not manage, and units merely on their way down, are
        // systemd's business.
        if !current.base.exists() || !unit.is_active_or_activating() {
            return Ok(());
        }

        let masked_or_removed = match tokio::fs::canonicalize(&new.base).await {
            Ok(target) => target == Path::new("/dev/null"),
            Err(_) => true,
        };
        if masked_or_removed {
            if let Some(info) = load_unit(&current).await {
                if info.bool_prop("Unit", "X-StopOnRemoval", false) {
                    self.add_stop(name);
                }
            }
            return Ok(());
        }

        if name.ends_with(".target") {
            let info = load_unit(&new).await.unwrap_or_default();
            let skip_start = SLEEP_TARGETS.contains(&name)
                || info.bool_prop("Unit", "RefuseManualStart", false)
                || info.bool_prop("Unit", "X-OnlyManualStart", false);
            if !skip_start {
                self.add_start(name)?;
                if !self.display_all_units {
                    self.plan.filter.insert(name.to_string());
                }
            }
            // A target whose members changed in incompatible orderings must
            // cycle to re-satisfy its dependencies.
            if info.bool_prop("Unit", "X-StopOnReconfiguration", false) {
                self.add_stop(name);
            }
            return Ok(());
        }

        let cur_info = load_unit(&current).await.unwrap_or_default();
        let new_info = load_unit(&new).await.unwrap_or_default();
        match compare_unit_files(&cur_info, &new_info) {
            UnitComparison::Equal => (),
            UnitComparison::NeedsRestart => {
                self.classify_modified(name, ClassifyPhase::PreActivation)
                    .await?;
            },
            UnitComparison::NeedsReload => {
                self.add_reload(name)?;
            },
        }
        Ok(())
    }

    /// Decide what to do with a modified non-target unit.
    pub async fn classify_modified(
        &mut self,
        name: &str,
        phase: ClassifyPhase,
    ) -> Result<(), SwitchError> {
        if name.ends_with(".path")
            || name.ends_with(".slice")
            || NEVER_CYCLED_TARGETS.contains(&name)
        {
            return Ok(());
        }
        if name.ends_with(".socket") {
            // Restarting a modified socket out from under the services it
            // feeds is unsolved upstream; leave the socket alone.
            return Ok(());
        }
        if let Some(mount_point) = mount_point_of(name) {
            if matches!(mount_point.as_str(), "/" | "/nix") {
                self.add_reload(name)?;
            } else {
                self.add_restart(name)?;
            }
            return Ok(());
        }

        let new = UnitFilePaths::resolve(&self.new_units_dir, name);
        let new_info = load_unit(&new).await.unwrap_or_default();

        if new_info.bool_prop("Service", "X-ReloadIfChanged", false)
            && !self.plan.restart.contains(name)
        {
            self.add_reload(name)?;
            self.plan.stop.remove(name);
            return Ok(());
        }

        if !new_info.bool_prop("Service", "X-RestartIfChanged", true)
            || new_info.bool_prop("Unit", "RefuseManualStop", false)
            || new_info.bool_prop("Unit", "X-OnlyManualStart", false)
        {
            self.plan.skip.insert(name.to_string());
            return Ok(());
        }

        if !new_info.bool_prop("Service", "X-StopIfChanged", true)
            || !name.ends_with(".service")
        {
            self.add_restart(name)?;
            return Ok(());
        }

        // A service that stops and starts cleanly. When it is
        // socket-activated, its sockets cycle too.
        let mut socket_activated = false;
        let mut sockets: Vec<String> = new_info
            .prop("Service", "Sockets")
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        // An absent and an empty Sockets= both mean the default socket.
        if sockets.is_empty() {
            sockets = vec![format!("{}.socket", unit_basename(name))];
        }
        for socket in &sockets {
            if !self.active.contains_key(socket) {
                continue;
            }
            let socket_files = UnitFilePaths::resolve(&self.new_units_dir, socket);
            if !socket_files.exists() {
                continue;
            }
            socket_activated = true;
            match phase {
                ClassifyPhase::PreActivation => {
                    self.add_stop(socket);
                    self.add_start(socket)?;
                },
                ClassifyPhase::PostActivation => {
                    self.add_restart(socket)?;
                },
            }
        }
        if new_info.bool_prop("Service", "X-NotSocketActivated", false) {
            socket_activated = false;
        }
        match phase {
            ClassifyPhase::PreActivation => {
                self.add_stop(name);
                self.add_start(name)?;
            },
            ClassifyPhase::PostActivation => {
                // A socket-activated service is left for its sockets to
                // wake on demand.
                if !socket_activated {
                    self.add_restart(name)?;
                }
            },
        }
        self.remove_reload(name)?;
        Ok(())
    }

    /// Fold the fstab reconciliation into the unit plan.
    pub fn apply_mount_changes(&mut self, changes: &MountChanges) -> Result<(), SwitchError> {
        for unit in &changes.stop {
            self.add_stop(unit);
        }
        for unit in &changes.restart {
            self.add_restart(unit)?;
        }
        for unit in &changes.reload {
            self.add_reload(unit)?;
        }
        for unit in &changes.skip {
            self.plan.skip.insert(unit.clone());
        }
        Ok(())
    }

    /// Consume the `*-by-activation` trigger files the activation script
    /// may have written, then remove them.
    #[tracing::instrument(skip_all)]
    pub async fn reclassify_after_activation(
        &mut self,
        dry_run: bool,
    ) -> Result<(), SwitchError> {
        let (restart_file, reload_file) = if dry_run {
            (
                lists::DRY_ACTIVATION_RESTART_LIST,
                lists::DRY_ACTIVATION_RELOAD_LIST,
            )
        } else {
            (lists::ACTIVATION_RESTART_LIST, lists::ACTIVATION_RELOAD_LIST)
        };

        for unit in self.lists.read(restart_file) {
            if !self.active.contains_key(&unit) {
                self.add_start(&unit)?;
            } else {
                self.classify_modified(&unit, ClassifyPhase::PostActivation)
                    .await?;
            }
        }
        for unit in self.lists.read(reload_file) {
            if self.active.contains_key(&unit) {
                self.add_reload(&unit)?;
            }
        }

        self.lists.remove_file(restart_file)?;
        self.lists.remove_file(reload_file)?;
        Ok(())
    }

    fn add_start(&mut self, unit: &str) -> Result<(), SwitchError> {
        if self.plan.start.insert(unit.to_string()) {
            self.lists.append(lists::START_LIST, unit)?;
        }
        Ok(())
    }

    fn add_stop(&mut self, unit: &str) {
        self.plan.stop.insert(unit.to_string());
    }

    fn add_restart(&mut self, unit: &str) -> Result<(), SwitchError> {
        self.remove_reload(unit)?;
        if self.plan.restart.insert(unit.to_string()) {
            self.lists.append(lists::RESTART_LIST, unit)?;
        }
        Ok(())
    }

    fn add_reload(&mut self, unit: &str) -> Result<(), SwitchError> {
        if self.plan.restart.contains(unit) {
            return Ok(());
        }
        if self.plan.reload.insert(unit.to_string()) {
            self.lists.append(lists::RELOAD_LIST, unit)?;
        }
        Ok(())
    }

    fn remove_reload(&mut self, unit: &str) -> Result<(), SwitchError> {
        if self.plan.reload.remove(unit) {
            self.lists.remove_entry(lists::RELOAD_LIST, unit)?;
        }
        Ok(())
    }
}
