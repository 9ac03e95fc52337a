//! Duplicate-delivery check store: one CRC per delivered file name, kept
//! per host. A failed size check removes its entry again so the retry is
//! not mistaken for a duplicate.

use std::io::Write;
use std::path::{Path, PathBuf};

fn store_path(work_dir: &Path, host_alias: &str) -> PathBuf {
    work_dir.join("crc").join(host_alias)
}

pub fn crc_of(name: &str) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(name.as_bytes());
    h.finalize()
}

fn read_all(path: &Path) -> Vec<u32> {
    match std::fs::read_to_string(path) {
        Ok(data) => data
            .lines()
            .filter_map(|l| u32::from_str_radix(l.trim(), 16).ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn contains(work_dir: &Path, host_alias: &str, name: &str) -> bool {
    let crc = crc_of(name);
    read_all(&store_path(work_dir, host_alias)).contains(&crc)
}

pub fn add(work_dir: &Path, host_alias: &str, name: &str) -> std::io::Result<()> {
    let path = store_path(work_dir, host_alias);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let crc = crc_of(name);
    let mut entries = read_all(&path);
    if !entries.contains(&crc) {
        entries.push(crc);
        let mut f = std::fs::File::create(&path)?;
        for e in entries {
            writeln!(f, "{:08x}", e)?;
        }
    }
    Ok(())
}

pub fn remove(work_dir: &Path, host_alias: &str, name: &str) -> std::io::Result<()> {
    let path = store_path(work_dir, host_alias);
    let crc = crc_of(name);
    let mut entries = read_all(&path);
    let before = entries.len();
    entries.retain(|&e| e != crc);
    if entries.len() != before {
        let mut f = std::fs::File::create(&path)?;
        for e in entries {
            writeln!(f, "{:08x}", e)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_contains_remove() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!contains(dir.path(), "h", "a.bin"));
        add(dir.path(), "h", "a.bin").unwrap();
        add(dir.path(), "h", "a.bin").unwrap();
        assert!(contains(dir.path(), "h", "a.bin"));
        assert!(!contains(dir.path(), "other", "a.bin"));
        remove(dir.path(), "h", "a.bin").unwrap();
        assert!(!contains(dir.path(), "h", "a.bin"));
    }
}
