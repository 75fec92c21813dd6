//! Staging directories and path handling for transferred files.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{Error, Result};

/// Create `dir` if needed and verify it accepts new files.
///
/// Newly created directories are made world-writable so that executor
/// processes running under other accounts can drop results into them.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    let directory_error = |reason: String| Error::Directory {
        path: dir.to_path_buf(),
        reason,
    };

    if !dir.is_dir() {
        std::fs::create_dir_all(dir).map_err(|e| directory_error(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
                .map_err(|e| directory_error(e.to_string()))?;
        }
        debug!(path = %dir.display(), "Created directory");
    }

    tempfile::Builder::new()
        .prefix(".write-check")
        .tempfile_in(dir)
        .map_err(|e| directory_error(e.to_string()))?;
    Ok(())
}

/// Create a fresh, uniquely named session directory under `root`.
///
/// Names combine the current Unix time with a random component: `s<secs>_<hex>`.
pub fn fresh_session_dir(root: &Path) -> Result<PathBuf> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let tag: u32 = rand::random();
    let dir = root.join(format!("s{secs}_{tag:08x}"));
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Final component of `name`, rejecting names that have none.
pub fn base_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Validation(format!("Filename must be non-blank: {name:?}")))
}

/// Expand `~`, `$VAR` and `${VAR}`, then normalize `.` and `..` lexically.
///
/// Unset variables are left as written.
pub fn expand_path(text: &str) -> PathBuf {
    let expanded = expand_vars(text);
    let expanded = match expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var("HOME") {
            Ok(home) => format!("{home}{rest}"),
            Err(_) => expanded,
        },
        _ => expanded,
    };
    normalize(Path::new(&expanded))
}

/// Turn a possibly relative path into an absolute one without touching the filesystem.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(path)))
    }
}

fn expand_vars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[pos..=pos + consumed]),
        }
        rest = &rest[pos + 1 + consumed..];
    }
    out.push_str(rest);
    out
}

fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        PathBuf::from(".")
    } else {
        parts.iter().collect()
    }
}
