//! Hosts and resolv.conf maintenance inside a container's bind-mount set.
//!
//! Several containers can share one network namespace and therefore one
//! hosts file, so every update runs under an advisory lock on a sibling
//! `.lock` file. Engine-managed lines carry a per-network marker comment so
//! a disconnect can remove exactly the entries it added.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::EngineError;

/// One engine-managed hosts line: address plus the names mapped to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: String,
    pub names: Vec<String>,
}

fn marker(network: &str) -> String {
    format!("# engine-net:{}", network)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Run `mutate` over the file's lines while holding the advisory lock, then
/// write the result back atomically enough for sibling containers.
fn with_locked_lines<F>(path: &Path, mutate: F) -> Result<(), EngineError>
where
    F: FnOnce(&mut Vec<String>),
{
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;
    let result = (|| {
        let mut contents = String::new();
        match OpenOptions::new().read(true).open(path) {
            Ok(mut f) => {
                f.read_to_string(&mut contents)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut lines: Vec<String> = contents.lines().map(String::from).collect();
        mutate(&mut lines);
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(out.as_bytes())?;
        Ok(())
    })();
    let _ = FileExt::unlock(&lock_file);
    result
}

/// Add hosts entries for a network, merging only lines not already present.
pub fn add_entries(path: &Path, network: &str, entries: &[HostEntry]) -> Result<(), EngineError> {
    let marker = marker(network);
    with_locked_lines(path, |lines| {
        for entry in entries {
            let line = format!("{}\t{}\t{}", entry.address, entry.names.join(" "), marker);
            let already = lines.iter().any(|l| {
                let mut fields = l.split_whitespace();
                fields.next() == Some(entry.address.as_str())
                    && entry.names.iter().all(|n| l.split_whitespace().any(|f| f == n))
            });
            if !already {
                lines.push(line);
            }
        }
    })
}

/// Remove every entry this engine added for `network`.
pub fn remove_entries(path: &Path, network: &str) -> Result<(), EngineError> {
    let marker = marker(network);
    with_locked_lines(path, |lines| {
        lines.retain(|l| !l.trim_end().ends_with(&marker));
    })
}

/// Merge nameservers into resolv.conf, keeping existing ones first.
pub fn add_nameservers(path: &Path, servers: &[String]) -> Result<(), EngineError> {
    with_locked_lines(path, |lines| {
        for server in servers {
            let line = format!("nameserver {}", server);
            if !lines.iter().any(|l| l.trim() == line) {
                lines.push(line);
            }
        }
    })
}

/// Drop nameserver lines for servers that are no longer wanted.
pub fn remove_nameservers(path: &Path, servers: &[String]) -> Result<(), EngineError> {
    with_locked_lines(path, |lines| {
        lines.retain(|l| {
            let trimmed = l.trim();
            !servers
                .iter()
                .any(|s| trimmed == format!("nameserver {}", s))
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(address: &str, names: &[&str]) -> HostEntry {
        HostEntry {
            address: address.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[test]
    fn test_add_and_remove_network_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        add_entries(&path, "n2", &[entry("10.89.0.2", &["web", "web.dns"])]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("10.89.0.2"));
        assert!(contents.contains("localhost"));

        // Re-adding the same entry does not duplicate it.
        add_entries(&path, "n2", &[entry("10.89.0.2", &["web", "web.dns"])]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("10.89.0.2").count(), 1);

        remove_entries(&path, "n2").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("10.89.0.2"));
        // Foreign lines survive.
        assert!(contents.contains("localhost"));
    }

    #[test]
    fn test_remove_targets_only_named_network() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");

        add_entries(&path, "a", &[entry("10.0.0.1", &["one"])]).unwrap();
        add_entries(&path, "b", &[entry("10.0.0.2", &["two"])]).unwrap();
        remove_entries(&path, "a").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("10.0.0.1"));
        assert!(contents.contains("10.0.0.2"));
    }

    #[test]
    fn test_nameserver_merge_only_new() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 1.1.1.1\n").unwrap();

        add_nameservers(&path, &["1.1.1.1".to_string(), "10.88.0.1".to_string()]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("1.1.1.1").count(), 1);
        assert!(contents.contains("10.88.0.1"));

        remove_nameservers(&path, &["10.88.0.1".to_string()]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("10.88.0.1"));
        assert!(contents.contains("1.1.1.1"));
    }

    #[test]
    fn test_missing_file_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        add_entries(&path, "n", &[entry("10.0.0.9", &["x"])]).unwrap();
        assert!(path.exists());
    }
}
