/*! INI-like unit file model: sections, repeated keys, and drop-in overlays.
*/

use std::path::Path;

use indexmap::IndexMap;

use super::UnitFilePaths;

/// The truthy spellings systemd accepts for boolean unit properties.
const TRUTHY: &[&str] = &["1", "yes", "true", "on"];

/// A parsed unit file: section → (key → ordered values, duplicates kept).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    sections: IndexMap<String, IndexMap<String, Vec<String>>>,
}

impl UnitInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();
        info.merge(text);
        info
    }

    /// Parse `text` into this unit, appending to already-present keys. This
    /// is both the base parse and the drop-in overlay operation.
    pub fn merge(&mut self, text: &str) {
        let mut section: Option<String> = None;
        let mut lines = text.lines();
        while let Some(raw) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = Some(name.to_string());
                continue;
            }
            let Some(section) = section.as_deref() else {
                // A key before any section header is malformed; skip it.
                continue;
            };
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let mut value = value.trim().to_string();
            // A trailing backslash continues the value on the next line.
            while let Some(stripped) = value.strip_suffix('\\') {
                value = stripped.trim_end().to_string();
                match lines.next() {
                    Some(cont) => {
                        value.push(' ');
                        value.push_str(cont.trim());
                    },
                    None => break,
                }
            }
            self.sections
                .entry(section.to_string())
                .or_default()
                .entry(key.trim().to_string())
                .or_default()
                .push(value);
        }
    }

    /// The last value of `key` in `section`, if any.
    pub fn prop(&self, section: &str, key: &str) -> Option<&str> {
        self.multi(section, key).last().map(String::as_str)
    }

    /// Every value of `key` in `section`, in file order.
    pub fn multi(&self, section: &str, key: &str) -> &[String] {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Interpret `key` as a boolean; absent keys yield `default`.
    pub fn bool_prop(&self, section: &str, key: &str, default: bool) -> bool {
        match self.prop(section, key) {
            Some(value) => TRUTHY.contains(&value),
            None => default,
        }
    }

    pub fn section(&self, name: &str) -> Option<&IndexMap<String, Vec<String>>> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &IndexMap<String, Vec<String>>)> {
        self.sections.iter().map(|(name, keys)| (name.as_str(), keys))
    }
}

/// Load a unit from its resolved file locations, overlaying the drop-ins
/// from `<unit>.d/*.conf` over the base. Returns `None` when no file exists.
/// Unreadable or malformed content is skipped, not fatal.
pub async fn load_unit(paths: &UnitFilePaths) -> Option<UnitInfo> {
    let mut info = UnitInfo::default();
    let mut found = false;
    let unit_file = paths.unit_file().to_path_buf();
    match tokio::fs::read_to_string(&unit_file).await {
        Ok(text) => {
            info.merge(&text);
            found = true;
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => {
            tracing::warn!("Skipping unreadable unit file `{}`: {e}", unit_file.display());
        },
    }
    for dropin in dropin_paths(&paths.concrete) {
        match tokio::fs::read_to_string(&dropin).await {
            Ok(text) => {
                info.merge(&text);
                found = true;
            },
            Err(e) => {
                tracing::warn!("Skipping unreadable drop-in `{}`: {e}", dropin.display());
            },
        }
    }
    found.then_some(info)
}

fn dropin_paths(unit_file: &Path) -> Vec<std::path::PathBuf> {
    let pattern = format!("{}.d/*.conf", unit_file.display());
    match glob::glob(&pattern) {
        Ok(paths) => paths.flatten().collect(),
        Err(e) => {
            tracing::warn!("Bad drop-in glob `{pattern}`: {e}");
            Vec::new()
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::systemd::UnitFilePaths;

    const NGINX: &str = "\
[Unit]
Description=nginx
After=network.target
After=nss-lookup.target

[Service]
ExecStart=/run/current-system/sw/bin/nginx
Restart=always
";

    #[test]
    fn prop_returns_the_last_value() {
        let info = UnitInfo::parse(NGINX);
        assert_eq!(info.prop("Unit", "After"), Some("nss-lookup.target"));
        assert_eq!(info.prop("Service", "Restart"), Some("always"));
        assert_eq!(info.prop("Service", "Missing"), None);
    }

    #[test]
    fn multi_preserves_duplicates_in_order() {
        let info = UnitInfo::parse(NGINX);
        assert_eq!(
            info.multi("Unit", "After"),
            &["network.target".to_string(), "nss-lookup.target".to_string()]
        );
    }

    #[test]
    fn bool_prop_accepts_the_systemd_truthy_set() {
        let info = UnitInfo::parse(
            "[Unit]\nA=1\nB=yes\nC=true\nD=on\nE=no\nF=nonsense\n",
        );
        for key in ["A", "B", "C", "D"] {
            assert!(info.bool_prop("Unit", key, false), "{key} should be true");
        }
        for key in ["E", "F"] {
            assert!(!info.bool_prop("Unit", key, true), "{key} should be false");
        }
        assert!(info.bool_prop("Unit", "Absent", true));
        assert!(!info.bool_prop("Unit", "Absent", false));
    }

    #[test]
    fn comments_and_junk_lines_are_skipped() {
        let info = UnitInfo::parse(
            "# comment\n; also a comment\nstray=line\n[Unit]\nnot a pair\nKey=value\n",
        );
        assert_eq!(info.prop("Unit", "Key"), Some("value"));
        assert!(info.section("stray").is_none());
    }

    #[test]
    fn continuation_lines_are_joined() {
        let info = UnitInfo::parse("[Service]\nExecStart=/bin/foo \\\n  --flag\n");
        assert_eq!(info.prop("Service", "ExecStart"), Some("/bin/foo --flag"));
    }

    #[tokio::test]
    async fn dropins_overlay_the_base_unit() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path();
        tokio::fs::write(dir.join("foo.service"), "[Service]\nExecStart=/bin/a\n").await?;
        tokio::fs::create_dir(dir.join("foo.service.d")).await?;
        tokio::fs::write(
            dir.join("foo.service.d/override.conf"),
            "[Service]\nExecStart=/bin/b\n",
        )
        .await?;

        let paths = UnitFilePaths::resolve(dir, "foo.service");
        let info = load_unit(&paths).await.expect("unit should load");
        assert_eq!(info.prop("Service", "ExecStart"), Some("/bin/b"));
        assert_eq!(info.multi("Service", "ExecStart").len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn templated_unit_falls_back_to_its_base_file() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path();
        tokio::fs::write(dir.join("getty@.service"), "[Unit]\nDescription=getty\n").await?;

        let paths = UnitFilePaths::resolve(dir, "getty@tty1.service");
        let info = load_unit(&paths).await.expect("base unit should load");
        assert_eq!(info.prop("Unit", "Description"), Some("getty"));

        Ok(())
    }

    #[tokio::test]
    async fn missing_unit_loads_as_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = UnitFilePaths::resolve(temp_dir.path(), "ghost.service");
        assert!(load_unit(&paths).await.is_none());
    }
}
