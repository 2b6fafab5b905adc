//! End-to-end planning scenarios against a synthesized root: two unit
//! trees, a set of live units, and the `/run/nixos` list files, with the
//! plan asserted at the other end.

use std::collections::BTreeMap;
use std::path::PathBuf;

use nixos_switch::activate::diff::UnitDiffer;
use nixos_switch::activate::fstab::{reconcile, Fstab};
use nixos_switch::activate::lists::{self, ListFiles};
use nixos_switch::activate::Plan;
use nixos_switch::systemd::bus::ActiveUnit;

struct Host {
    _temp: tempfile::TempDir,
    current_units: PathBuf,
    toplevel: PathBuf,
    run_dir: PathBuf,
    active: BTreeMap<String, ActiveUnit>,
}

impl Host {
    fn new() -> eyre::Result<Self> {
        let temp = tempfile::tempdir()?;
        let current_units = temp.path().join("etc/systemd/system");
        let toplevel = temp.path().join("toplevel");
        std::fs::create_dir_all(&current_units)?;
        std::fs::create_dir_all(toplevel.join("etc/systemd/system"))?;
        Ok(Self {
            run_dir: temp.path().join("run/nixos"),
            _temp: temp,
            current_units,
            toplevel,
            active: BTreeMap::new(),
        })
    }

    fn current_unit(&self, name: &str, text: &str) -> eyre::Result<()> {
        std::fs::write(self.current_units.join(name), text)?;
        Ok(())
    }

    fn new_unit(&self, name: &str, text: &str) -> eyre::Result<()> {
        std::fs::write(self.toplevel.join("etc/systemd/system").join(name), text)?;
        Ok(())
    }

    fn mark_active(&mut self, name: &str) {
        self.active.insert(
            name.to_string(),
            ActiveUnit {
                name: name.to_string(),
                active_state: "active".to_string(),
                sub_state: "running".to_string(),
            },
        );
    }

    async fn plan(&self, lists: &ListFiles) -> eyre::Result<Plan> {
        let mut differ = UnitDiffer::new(
            &self.current_units,
            &self.toplevel,
            &self.active,
            lists,
            false,
        );
        differ.plan_units().await?;
        Ok(differ.into_plan())
    }

    fn lists(&self) -> ListFiles {
        ListFiles::new(&self.run_dir, false)
    }
}

#[tokio::test]
async fn inert_description_change_yields_an_empty_plan() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit(
        "foo.service",
        "[Unit]\nDescription=a\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.new_unit(
        "foo.service",
        "[Unit]\nDescription=b\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.mark_active("foo.service");

    let plan = host.plan(&host.lists()).await?;
    assert!(plan.is_empty(), "plan should be empty: {plan:?}");

    Ok(())
}

#[tokio::test]
async fn reload_trigger_change_reloads_and_records() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=/nix/store/aaa-v1\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.new_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=/nix/store/bbb-v2\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.mark_active("foo.service");

    let lists = host.lists();
    let plan = host.plan(&lists).await?;
    assert!(plan.reload.contains("foo.service"));
    assert!(plan.restart.is_empty());
    assert_eq!(lists.read(lists::RELOAD_LIST), vec!["foo.service"]);

    Ok(())
}

#[tokio::test]
async fn modified_socket_activated_service_cycles_with_its_socket() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit("foo.service", "[Service]\nExecStart=/bin/foo-v1\n")?;
    // An empty Sockets= means the default <basename>.socket.
    host.new_unit("foo.service", "[Service]\nExecStart=/bin/foo-v2\nSockets=\n")?;
    host.current_unit("foo.socket", "[Socket]\nListenStream=/run/foo.sock\n")?;
    host.new_unit("foo.socket", "[Socket]\nListenStream=/run/foo.sock\n")?;
    host.mark_active("foo.service");
    host.mark_active("foo.socket");

    let plan = host.plan(&host.lists()).await?;
    for unit in ["foo.service", "foo.socket"] {
        assert!(plan.stop.contains(unit), "{unit} should stop");
        assert!(plan.start.contains(unit), "{unit} should start");
        assert!(!plan.reload.contains(unit), "{unit} must not reload");
    }

    Ok(())
}

#[tokio::test]
async fn reconfigured_target_cycles_and_is_filtered() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit("multi-user.target", "[Unit]\nDescription=old\n")?;
    host.new_unit(
        "multi-user.target",
        "[Unit]\nDescription=new\nX-StopOnReconfiguration=yes\n",
    )?;
    host.mark_active("multi-user.target");

    let plan = host.plan(&host.lists()).await?;
    assert!(plan.start.contains("multi-user.target"));
    assert!(plan.stop.contains("multi-user.target"));
    assert!(plan.filter.contains("multi-user.target"));
    // Filtered units are hidden from the log lines but still executed.
    assert!(!plan.displayed(&plan.start).contains(&"multi-user.target"));

    Ok(())
}

#[tokio::test]
async fn display_all_units_disables_the_filter() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit("multi-user.target", "[Unit]\nDescription=old\n")?;
    host.new_unit("multi-user.target", "[Unit]\nDescription=new\n")?;
    host.mark_active("multi-user.target");

    let lists = host.lists();
    let mut differ = UnitDiffer::new(
        &host.current_units,
        &host.toplevel,
        &host.active,
        &lists,
        true,
    );
    differ.plan_units().await?;
    let plan = differ.into_plan();
    assert!(plan.start.contains("multi-user.target"));
    assert!(plan.filter.is_empty());

    Ok(())
}

#[tokio::test]
async fn masked_unit_without_stop_on_removal_is_left_alone() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit("foo.service", "[Service]\nExecStart=/bin/foo\n")?;
    std::os::unix::fs::symlink(
        "/dev/null",
        host.toplevel.join("etc/systemd/system/foo.service"),
    )?;
    host.mark_active("foo.service");

    let plan = host.plan(&host.lists()).await?;
    assert!(plan.is_empty(), "masked unit must not be touched: {plan:?}");

    Ok(())
}

#[tokio::test]
async fn removed_unit_with_stop_on_removal_stops() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit(
        "foo.service",
        "[Unit]\nX-StopOnRemoval=yes\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.mark_active("foo.service");

    let plan = host.plan(&host.lists()).await?;
    assert_eq!(plan.stop.len(), 1);
    assert!(plan.stop.contains("foo.service"));
    assert!(plan.start.is_empty());
    assert!(plan.restart.is_empty());

    Ok(())
}

#[tokio::test]
async fn dry_activation_writes_nothing_under_run() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=v1\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.new_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=v2\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.mark_active("foo.service");

    let lists = ListFiles::new(&host.run_dir, true);
    let plan = host.plan(&lists).await?;
    assert!(plan.reload.contains("foo.service"));
    assert!(!host.run_dir.exists(), "dry-activate must not write lists");

    Ok(())
}

#[tokio::test]
async fn a_second_planning_run_consolidates_recorded_verdicts() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit("foo.service", "[Service]\nExecStart=/bin/foo-v1\n")?;
    host.new_unit("foo.service", "[Service]\nExecStart=/bin/foo-v2\n")?;
    host.mark_active("foo.service");

    let lists = host.lists();
    let first = host.plan(&lists).await?;
    // Same transitions replayed over the now-populated list files.
    let second = host.plan(&lists).await?;
    assert_eq!(first.start, second.start);
    assert_eq!(first.stop, second.stop);
    assert_eq!(first.restart, second.restart);
    assert_eq!(first.reload, second.reload);

    Ok(())
}

#[tokio::test]
async fn activation_restart_list_moves_units_out_of_reload() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.current_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=v1\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.new_unit(
        "foo.service",
        "[Unit]\nX-Reload-Triggers=v2\n[Service]\nExecStart=/bin/foo\n",
    )?;
    host.mark_active("foo.service");

    let lists = host.lists();
    let mut differ = UnitDiffer::new(
        &host.current_units,
        &host.toplevel,
        &host.active,
        &lists,
        false,
    );
    differ.plan_units().await?;
    assert!(differ.plan().reload.contains("foo.service"));

    // The activation script asked for a restart of the same unit.
    lists.append(lists::ACTIVATION_RESTART_LIST, "foo.service")?;
    differ.reclassify_after_activation(false).await?;

    let plan = differ.into_plan();
    assert!(plan.restart.contains("foo.service"));
    assert!(!plan.reload.contains("foo.service"), "restart and reload are disjoint");
    assert_eq!(lists.read(lists::RELOAD_LIST), Vec::<String>::new());
    assert!(!lists.path(lists::ACTIVATION_RESTART_LIST).exists());

    Ok(())
}

#[tokio::test]
async fn inactive_units_from_the_activation_list_start_instead() -> eyre::Result<()> {
    let host = Host::new()?;
    let lists = host.lists();
    lists.append(lists::ACTIVATION_RESTART_LIST, "fresh.service")?;

    let mut differ = UnitDiffer::new(
        &host.current_units,
        &host.toplevel,
        &host.active,
        &lists,
        false,
    );
    differ.plan_units().await?;
    differ.reclassify_after_activation(false).await?;

    let plan = differ.into_plan();
    assert!(plan.start.contains("fresh.service"));
    assert!(plan.restart.is_empty());

    Ok(())
}

#[tokio::test]
async fn fstab_changes_overlay_the_unit_plan() -> eyre::Result<()> {
    let mut host = Host::new()?;
    host.mark_active("nginx.service");

    let current = Fstab::parse(
        "/dev/sda1 / ext4 rw,relatime\n\
         /dev/sda2 /data ext4 rw\n\
         /dev/sdb2 none swap defaults\n",
    );
    let new = Fstab::parse("/dev/sda1 / ext4 rw,noatime\n");
    let changes = reconcile(&current, &new);

    let lists = host.lists();
    let mut differ = UnitDiffer::new(
        &host.current_units,
        &host.toplevel,
        &host.active,
        &lists,
        false,
    );
    differ.plan_units().await?;
    differ.apply_mount_changes(&changes)?;

    let plan = differ.into_plan();
    assert!(plan.reload.contains("-.mount"));
    assert!(plan.stop.contains("data.mount"));
    assert!(!plan.restart.contains("-.mount"), "/ is never restarted");
    assert_eq!(changes.stale_swaps, vec!["/dev/sdb2"]);

    Ok(())
}
