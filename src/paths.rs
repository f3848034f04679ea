//! Path containment for session homes, shell quoting, and the JSON state
//! files the stores persist to.
//!
//! Containment is lexical: `..` and `.` are folded without touching the
//! filesystem, so a rejected path is never stat'ed or opened.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves `input` against `home` and rejects anything that lands outside it.
///
/// `~` and `~/x` expand to the home itself; absolute inputs are taken as-is
/// and must already live under `home`.
pub fn resolve_in_home(home: &Path, input: &str) -> Result<PathBuf> {
    let input = input.trim().trim_matches(|c| c == '"' || c == '\'');
    let home = normalize(home);

    let joined = if input == "~" {
        home.clone()
    } else if let Some(rest) = input.strip_prefix("~/") {
        home.join(rest)
    } else if Path::new(input).is_absolute() {
        PathBuf::from(input)
    } else {
        home.join(input)
    };

    let resolved = normalize(&joined);
    if resolved.starts_with(&home) {
        Ok(resolved)
    } else {
        Err(Error::PathTraversal(input.to_string()))
    }
}

/// Lexically folds `.` and `..`. Relative paths stay relative; `..` never
/// climbs above the first component.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Quotes `s` for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Writes `value` to a sibling temp file and renames it over `path`.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// `Ok(None)` when the file does not exist yet.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_stay_inside() {
        let home = Path::new("/data/s1");
        assert_eq!(
            resolve_in_home(home, "notes/a.txt").unwrap(),
            PathBuf::from("/data/s1/notes/a.txt")
        );
        assert_eq!(
            resolve_in_home(home, "a/../b.txt").unwrap(),
            PathBuf::from("/data/s1/b.txt")
        );
        assert_eq!(resolve_in_home(home, "~").unwrap(), PathBuf::from("/data/s1"));
        assert_eq!(
            resolve_in_home(home, "~/x").unwrap(),
            PathBuf::from("/data/s1/x")
        );
    }

    #[test]
    fn traversal_is_rejected() {
        let home = Path::new("/data/s1");
        for bad in ["../../etc/passwd", "..", "/etc/passwd", "a/../../s2/x", "~/../s2"] {
            assert!(
                matches!(resolve_in_home(home, bad), Err(Error::PathTraversal(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn sibling_prefix_is_not_inside() {
        // "/data/s10" shares a string prefix with "/data/s1" but not a path prefix.
        let home = Path::new("/data/s1");
        assert!(resolve_in_home(home, "/data/s10/x").is_err());
    }

    #[test]
    fn relative_home_works() {
        let home = Path::new("user_data/abc");
        assert_eq!(
            resolve_in_home(home, "./f").unwrap(),
            PathBuf::from("user_data/abc/f")
        );
        assert!(resolve_in_home(home, "../def/f").is_err());
    }

    #[tokio::test]
    async fn missing_state_file_reads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        assert!(read_json::<Vec<u32>>(&path).await.unwrap().is_none());

        write_json_atomic(&path, &vec![1u32, 2]).await.unwrap();
        assert_eq!(read_json::<Vec<u32>>(&path).await.unwrap(), Some(vec![1, 2]));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
