//! Small helpers shared across modules. Named after the teacher's
//! `libaflstar_bolts` module: stuff that is handy but not directly part of
//! any single component.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Creates `path` and any missing parents. A no-op if it already exists.
pub fn mkdir(path: impl AsRef<Path>) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time in seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Scans `cmd` for a literal `@@` token. If present, returns the command
/// with the token replaced by `input_path` and no stdin payload. If absent,
/// returns the command unmodified along with the bytes that should be
/// written to the child's stdin.
pub fn fix_at_file(cmd: &[String], input_path: &Path) -> (Vec<String>, Option<Vec<u8>>) {
    let path_str = input_path.to_string_lossy().to_string();
    if cmd.iter().any(|tok| tok.contains("@@")) {
        let replaced = cmd
            .iter()
            .map(|tok| tok.replace("@@", &path_str))
            .collect();
        (replaced, None)
    } else {
        let stdin = fs::read(input_path).unwrap_or_default();
        (cmd.to_vec(), Some(stdin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_at_file_substitutes_token() {
        let cmd = vec!["target".to_string(), "@@".to_string()];
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let (out, stdin) = fix_at_file(&cmd, tmp.path());
        assert_eq!(out[1], tmp.path().to_string_lossy());
        assert!(stdin.is_none());
    }

    #[test]
    fn fix_at_file_falls_back_to_stdin() {
        let cmd = vec!["target".to_string()];
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(b"hello").unwrap();
        let (out, stdin) = fix_at_file(&cmd, tmp.path());
        assert_eq!(out, cmd);
        assert_eq!(stdin.unwrap(), b"hello");
    }
}
