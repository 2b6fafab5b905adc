/*! fstab(5) parsing and the mount/swap reconciliation between two
configurations.
*/

use indexmap::IndexMap;

use crate::systemd::mount_unit_name;

/// One non-swap fstab entry, keyed by mount point in [`Fstab`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemEntry {
    pub device: String,
    pub fs_type: String,
    pub options: String,
}

/// One swap entry, keyed by device in [`Fstab`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEntry {
    pub options: String,
}

/// A parsed fstab: filesystems by mount point, swaps by device.
#[derive(Debug, Default, Clone)]
pub struct Fstab {
    pub filesystems: IndexMap<String, FilesystemEntry>,
    pub swaps: IndexMap<String, SwapEntry>,
}

impl Fstab {
    /// Parse fstab text. Comment lines are skipped; lines with fewer than
    /// three fields are skipped too (a parse error is never fatal). The
    /// fourth field defaults to `defaults`.
    pub fn parse(text: &str) -> Self {
        let mut fstab = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mount_point), Some(fs_type)) =
                (fields.next(), fields.next(), fields.next())
            else {
                tracing::warn!("Skipping malformed fstab line `{line}`");
                continue;
            };
            let options = fields.next().unwrap_or("defaults").to_string();
            if fs_type == "swap" {
                fstab
                    .swaps
                    .insert(device.to_string(), SwapEntry { options });
            } else {
                fstab.filesystems.insert(
                    mount_point.to_string(),
                    FilesystemEntry {
                        device: device.to_string(),
                        fs_type: fs_type.to_string(),
                        options,
                    },
                );
            }
        }
        fstab
    }
}

/// The mount-unit verdicts and vanished swap devices produced by comparing
/// two fstabs. Unit names are already escaped `.mount` names.
#[derive(Debug, Default, Clone)]
pub struct MountChanges {
    pub stop: Vec<String>,
    pub restart: Vec<String>,
    pub reload: Vec<String>,
    pub skip: Vec<String>,
    /// Devices to `swapoff(2)` at execution time.
    pub stale_swaps: Vec<String>,
}

/// Mount points that must never be restarted: unmounting them takes the
/// host down with it.
fn is_sacred_mount_point(mount_point: &str) -> bool {
    matches!(mount_point, "/" | "/nix")
}

/// Compare the current and new fstabs per-mount-point.
#[tracing::instrument(skip_all)]
pub fn reconcile(current: &Fstab, new: &Fstab) -> MountChanges {
    let mut changes = MountChanges::default();

    for (mount_point, cur) in &current.filesystems {
        let unit = mount_unit_name(mount_point);
        match new.filesystems.get(mount_point) {
            None => changes.stop.push(unit),
            Some(new) if new.fs_type != cur.fs_type || new.device != cur.device => {
                if is_sacred_mount_point(mount_point) {
                    tracing::warn!(
                        "Not restarting `{unit}`: the {mount_point} filesystem changed \
                         but cannot be remounted while the system is running"
                    );
                    changes.skip.push(unit);
                } else {
                    changes.restart.push(unit);
                }
            },
            Some(new) if new.options != cur.options => changes.reload.push(unit),
            Some(_) => (),
        }
    }

    for device in current.swaps.keys() {
        if !new.swaps.contains_key(device) {
            changes.stale_swaps.push(device.clone());
        }
    }

    changes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn swap_lines_route_to_the_swap_map() {
        let fstab = Fstab::parse(
            "# a comment\n\
             /dev/sda1 / ext4 rw,relatime\n\
             /dev/sdb2 none swap defaults\n\
             short line\n",
        );
        assert_eq!(fstab.filesystems.len(), 1);
        assert_eq!(fstab.swaps.len(), 1);
        assert!(fstab.swaps.contains_key("/dev/sdb2"));
    }

    #[test]
    fn missing_options_default_to_defaults() {
        let fstab = Fstab::parse("/dev/sda1 /data ext4\n");
        assert_eq!(fstab.filesystems["/data"].options, "defaults");
    }

    #[test]
    fn vanished_mount_points_stop() {
        let cur = Fstab::parse("/dev/sda2 /data ext4 rw\n");
        let new = Fstab::parse("");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.stop, vec!["data.mount"]);
    }

    #[test]
    fn changed_device_restarts_ordinary_mounts() {
        let cur = Fstab::parse("/dev/sda2 /data ext4 rw\n");
        let new = Fstab::parse("/dev/sdb1 /data ext4 rw\n");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.restart, vec!["data.mount"]);
    }

    #[test]
    fn root_options_change_reloads_never_restarts() {
        // An options-only change on / must reload -.mount, never restart.
        let cur = Fstab::parse("/dev/sda1 / ext4 rw,relatime\n");
        let new = Fstab::parse("/dev/sda1 / ext4 rw,noatime\n");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.reload, vec!["-.mount"]);
        assert!(changes.restart.is_empty());
    }

    #[test]
    fn root_device_change_is_skipped() {
        let cur = Fstab::parse("/dev/sda1 / ext4 rw\n");
        let new = Fstab::parse("/dev/sdb1 / ext4 rw\n");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.skip, vec!["-.mount"]);
        assert!(changes.restart.is_empty());
    }

    #[test]
    fn nix_mount_is_as_sacred_as_root() {
        let cur = Fstab::parse("/dev/sda1 /nix ext4 rw\n");
        let new = Fstab::parse("/dev/sdb1 /nix btrfs rw\n");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.skip, vec!["nix.mount"]);
        assert!(changes.restart.is_empty());
    }

    #[test]
    fn vanished_swaps_are_collected_for_swapoff() {
        // The swap disappears from the new fstab.
        let cur = Fstab::parse("/dev/sdb2 none swap defaults\n");
        let new = Fstab::parse("");
        let changes = reconcile(&cur, &new);
        assert_eq!(changes.stale_swaps, vec!["/dev/sdb2"]);
    }

    #[test]
    fn unchanged_entries_produce_no_changes() {
        let cur = Fstab::parse("/dev/sda1 / ext4 rw\n/dev/sdb2 none swap defaults\n");
        let changes = reconcile(&cur, &cur.clone());
        assert!(changes.stop.is_empty());
        assert!(changes.restart.is_empty());
        assert!(changes.reload.is_empty());
        assert!(changes.stale_swaps.is_empty());
    }
}
