/*! systemd unit identity: names, templates, and the unit-name path escape.
*/

pub mod bus;
pub mod unit_file;

use std::path::{Path, PathBuf};

/// Relative location of the unit tree inside a toplevel (and under `/`).
pub const SYSTEM_UNITS_DIR: &str = "etc/systemd/system";

/// The base unit of a templated unit: `<base>@<instance>.<type>` becomes
/// `<base>@.<type>`. Non-templated names are returned unchanged.
pub fn base_unit_name(unit: &str) -> String {
    if let Some((stem, ext)) = unit.rsplit_once('.') {
        if let Some((base, instance)) = stem.split_once('@') {
            if !instance.is_empty() {
                return format!("{base}@.{ext}");
            }
        }
    }
    unit.to_string()
}

/// The unit name minus its extension.
pub fn unit_basename(unit: &str) -> &str {
    unit.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(unit)
}

/// Resolved unit file locations for one unit under one unit tree.
///
/// `concrete` is `<dir>/<unit>`; for templated units whose concrete file is
/// absent the `base` file (`<dir>/<base>@.<type>`) is consulted instead.
#[derive(Debug, Clone)]
pub struct UnitFilePaths {
    pub concrete: PathBuf,
    pub base: PathBuf,
}

impl UnitFilePaths {
    pub fn resolve(dir: &Path, unit: &str) -> Self {
        Self {
            concrete: dir.join(unit),
            base: dir.join(base_unit_name(unit)),
        }
    }

    /// The file to parse: the concrete file when present, the template base
    /// otherwise.
    pub fn unit_file(&self) -> &Path {
        if self.concrete.exists() {
            &self.concrete
        } else {
            &self.base
        }
    }

    /// Whether any file backs this unit.
    pub fn exists(&self) -> bool {
        self.concrete.exists() || self.base.exists()
    }
}

/// Escape a mount point into a systemd unit name stem, per systemd.unit(5).
///
/// `/` becomes `-`; path separators become dashes; everything outside
/// `[a-zA-Z0-9:_.]` (and a leading `.`) becomes `\xXX`.
pub fn escape_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return "-".to_string();
    }
    let mut out = String::with_capacity(path.len());
    for (idx, component) in components.iter().enumerate() {
        if idx > 0 {
            out.push('-');
        }
        for c in component.chars() {
            let first = out.is_empty();
            if c.is_ascii_alphanumeric() || c == ':' || c == '_' || (c == '.' && !first) {
                out.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
            }
        }
    }
    out
}

/// The `.mount` unit name corresponding to a mount point.
pub fn mount_unit_name(mount_point: &str) -> String {
    format!("{}.mount", escape_path(mount_point))
}

/// Reverse [`escape_path`]: recover a mount point from a unit name stem.
pub fn unescape_path(escaped: &str) -> String {
    if escaped == "-" {
        return "/".to_string();
    }
    let mut out = String::with_capacity(escaped.len() + 1);
    out.push('/');
    let bytes = escaped.as_bytes();
    let mut i = 0;
    let mut raw = Vec::with_capacity(escaped.len());
    while i < bytes.len() {
        match bytes[i] {
            b'-' => {
                raw.push(b'/');
                i += 1;
            },
            b'\\' if i + 3 < bytes.len() && bytes[i + 1] == b'x' => {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match hex {
                    Some(byte) => {
                        raw.push(byte);
                        i += 4;
                    },
                    None => {
                        raw.push(bytes[i]);
                        i += 1;
                    },
                }
            },
            b => {
                raw.push(b);
                i += 1;
            },
        }
    }
    out.push_str(&String::from_utf8_lossy(&raw));
    out
}

/// The mount point of a `.mount` unit, if `unit` is one.
pub fn mount_point_of(unit: &str) -> Option<String> {
    unit.strip_suffix(".mount").map(unescape_path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn templated_units_resolve_to_their_base() {
        assert_eq!(base_unit_name("getty@tty1.service"), "getty@.service");
        assert_eq!(base_unit_name("getty@.service"), "getty@.service");
        assert_eq!(base_unit_name("sshd.service"), "sshd.service");
    }

    #[test]
    fn basename_strips_the_extension() {
        assert_eq!(unit_basename("nginx.service"), "nginx");
        assert_eq!(unit_basename("getty@tty1.service"), "getty@tty1");
    }

    #[test]
    fn root_escapes_to_a_single_dash() {
        assert_eq!(mount_unit_name("/"), "-.mount");
    }

    #[test]
    fn path_components_become_dashes() {
        assert_eq!(mount_unit_name("/nix"), "nix.mount");
        assert_eq!(mount_unit_name("/var/lib/machines"), "var-lib-machines.mount");
    }

    #[test]
    fn odd_characters_are_hex_escaped() {
        assert_eq!(escape_path("/mnt/a b"), "mnt-a\\x20b");
    }

    #[test]
    fn unescape_inverts_escape() {
        for path in ["/", "/nix", "/var/lib/machines", "/mnt/a b"] {
            assert_eq!(unescape_path(&escape_path(path)), path);
        }
    }

    #[test]
    fn mount_point_recovers_from_unit_name() {
        assert_eq!(mount_point_of("-.mount").as_deref(), Some("/"));
        assert_eq!(mount_point_of("nix.mount").as_deref(), Some("/nix"));
        assert_eq!(mount_point_of("nginx.service"), None);
    }
}
