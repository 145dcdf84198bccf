//! `download_record.json`：已完成集的清单（文件名、大小、sha256）。

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const RECORD_FILE: &str = "download_record.json";
pub const SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub index: u32,
    pub title: String,
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub title: String,
    pub source: String,
    #[serde(default)]
    pub episodes: BTreeMap<u32, RecordEntry>,
}

impl DownloadRecord {
    pub fn path_in(book_dir: &Path) -> PathBuf {
        book_dir.join(RECORD_FILE)
    }

    /// 读取记录；文件不存在或损坏时返回空记录。
    pub fn load(book_dir: &Path) -> Self {
        let path = Self::path_in(book_dir);
        let Ok(raw) = fs::read(&path) else {
            return Self::default();
        };
        match serde_json::from_slice(&raw) {
            Ok(rec) => rec,
            Err(err) => {
                tracing::warn!(target: "plan", path = %path.display(), "ignoring unreadable download record: {err}");
                Self::default()
            }
        }
    }

    pub fn save(&self, book_dir: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&Self::path_in(book_dir), &bytes)
    }

    pub fn upsert(&mut self, entry: RecordEntry) {
        self.episodes.insert(entry.index, entry);
    }

    pub fn get(&self, index: u32) -> Option<&RecordEntry> {
        self.episodes.get(&index)
    }
}

/// 先写临时文件再重命名，避免中断时留下半个 JSON。
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    if path.exists() {
        // Windows 上 rename 不会覆盖已有文件
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path)
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = DownloadRecord {
            title: "书".into(),
            source: "https://example.test/book/1.html".into(),
            ..DownloadRecord::default()
        };
        rec.upsert(RecordEntry {
            index: 3,
            title: "第3集".into(),
            file: "0003_第3集.mp3".into(),
            bytes: 10,
            sha256: "ab".into(),
        });
        rec.save(dir.path()).unwrap();

        let loaded = DownloadRecord::load(dir.path());
        assert_eq!(loaded.title, "书");
        assert_eq!(loaded.get(3).map(|e| e.bytes), Some(10));
        assert!(!dir.path().join("download_record.tmp").exists());
    }

    #[test]
    fn corrupt_record_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RECORD_FILE), b"{not json").unwrap();
        assert!(DownloadRecord::load(dir.path()).episodes.is_empty());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.bin");
        fs::write(&p, b"abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
