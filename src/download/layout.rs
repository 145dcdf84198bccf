//! 输出目录布局与已下载文件的完整性判断。

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::base_system::book_paths::{episode_prefix, episode_stem, is_audio_ext};

use super::models::EpisodeRef;
use super::record::{DownloadRecord, sha256_file};

const SNIFF_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    /// 大小 + 文件头。
    Signature,
    /// 与下载记录中的 sha256 比对。
    Hash,
}

impl IntegrityMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "signature" | "sig" => Some(Self::Signature),
            "hash" | "sha256" => Some(Self::Hash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Present(PathBuf),
    Missing(MissingReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingReason {
    NoFile,
    TooSmall(u64),
    BadSignature,
    Unrecorded,
    HashMismatch,
    Unreadable(String),
}

/// 识别常见音频容器的文件头，返回格式名。
pub fn sniff_audio(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"ID3") {
        return Some("mp3");
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some("m4a");
    }
    if head.starts_with(b"OggS") {
        return Some("ogg");
    }
    if head.starts_with(b"fLaC") {
        return Some("flac");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WAVE" {
        return Some("wav");
    }
    if head.len() >= 2 && head[0] == 0xFF {
        // ADTS: 1111 1111 1111 xxx(layer=00)x
        if head[1] & 0xF6 == 0xF0 {
            return Some("aac");
        }
        // MPEG 音频帧同步：11 位全 1，layer 不为 00
        if head[1] & 0xE0 == 0xE0 && head[1] & 0x06 != 0 {
            return Some("mp3");
        }
    }
    None
}

pub fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let mut f = fs::File::open(path)?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// 签名检查：大小达标且文件头可识别。
pub fn check_signature(path: &Path, min_bytes: u64) -> Result<u64, MissingReason> {
    let meta = fs::metadata(path).map_err(|e| MissingReason::Unreadable(e.to_string()))?;
    let len = meta.len();
    if len == 0 || len < min_bytes {
        return Err(MissingReason::TooSmall(len));
    }
    let head = read_head(path).map_err(|e| MissingReason::Unreadable(e.to_string()))?;
    if sniff_audio(&head).is_none() {
        return Err(MissingReason::BadSignature);
    }
    Ok(len)
}

/// 查找某集的已有文件：先按完整文件名（标题不变），再按 `NNNN_` 前缀（标题改过）。
pub fn find_episode_file(book_dir: &Path, episode: &EpisodeRef) -> Option<PathBuf> {
    let stem = episode_stem(episode.index, &episode.title);
    let prefix = episode_prefix(episode.index);
    let rd = fs::read_dir(book_dir).ok()?;

    let mut by_prefix: Vec<PathBuf> = Vec::new();
    for entry in rd.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .map(is_audio_ext)
            .unwrap_or(false);
        if !is_audio {
            continue;
        }
        let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if file_stem == stem {
            return Some(path);
        }
        if file_stem.starts_with(&prefix) {
            by_prefix.push(path);
        }
    }
    by_prefix.sort();
    by_prefix.into_iter().next()
}

pub struct IntegrityCheck<'a> {
    pub mode: IntegrityMode,
    pub min_bytes: u64,
    pub record: &'a DownloadRecord,
}

impl IntegrityCheck<'_> {
    pub fn classify(&self, book_dir: &Path, episode: &EpisodeRef) -> Presence {
        let Some(path) = find_episode_file(book_dir, episode) else {
            return Presence::Missing(MissingReason::NoFile);
        };
        match self.mode {
            IntegrityMode::Signature => match check_signature(&path, self.min_bytes) {
                Ok(_) => Presence::Present(path),
                Err(reason) => Presence::Missing(reason),
            },
            IntegrityMode::Hash => {
                let Some(entry) = self.record.get(episode.index) else {
                    return Presence::Missing(MissingReason::Unrecorded);
                };
                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if entry.file != file_name {
                    return Presence::Missing(MissingReason::Unrecorded);
                }
                match sha256_file(&path) {
                    Ok(digest) if digest.eq_ignore_ascii_case(&entry.sha256) => {
                        Presence::Present(path)
                    }
                    Ok(_) => Presence::Missing(MissingReason::HashMismatch),
                    Err(e) => Presence::Missing(MissingReason::Unreadable(e.to_string())),
                }
            }
        }
    }
}

/// 删除同一集的其它旧文件（例如扩展名变了的损坏文件）。
pub fn remove_other_episode_files(book_dir: &Path, index: u32, keep: &Path) -> io::Result<()> {
    let prefix = episode_prefix(index);
    let Ok(rd) = fs::read_dir(book_dir) else {
        return Ok(());
    };
    for entry in rd.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == keep || !path.is_file() {
            continue;
        }
        let name_ok = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(&prefix))
            .unwrap_or(false);
        let audio = path
            .extension()
            .and_then(|e| e.to_str())
            .map(is_audio_ext)
            .unwrap_or(false);
        if name_ok && audio {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::record::RecordEntry;

    fn ep(index: u32, title: &str) -> EpisodeRef {
        EpisodeRef {
            index,
            title: title.into(),
            url: format!("https://example.test/{index}"),
        }
    }

    fn mp3_bytes(len: usize) -> Vec<u8> {
        let mut v = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        v.resize(len, 0x55);
        v
    }

    #[test]
    fn sniffs_known_containers() {
        assert_eq!(sniff_audio(b"ID3\x03\x00"), Some("mp3"));
        assert_eq!(sniff_audio(&[0xFF, 0xFB, 0x90, 0x00]), Some("mp3"));
        assert_eq!(sniff_audio(&[0xFF, 0xF1, 0x50, 0x80]), Some("aac"));
        assert_eq!(sniff_audio(b"\x00\x00\x00\x20ftypM4A \x00\x00"), Some("m4a"));
        assert_eq!(sniff_audio(b"OggS\x00\x02"), Some("ogg"));
        assert_eq!(sniff_audio(b"fLaC\x00\x00"), Some("flac"));
        assert_eq!(sniff_audio(b"RIFF\x24\x00\x00\x00WAVEfmt "), Some("wav"));
        assert_eq!(sniff_audio(b"<!DOCTYPE html>"), None);
        assert_eq!(sniff_audio(b""), None);
    }

    #[test]
    fn signature_mode_rejects_small_and_html_files() {
        let dir = tempfile::tempdir().unwrap();
        let record = DownloadRecord::default();
        let check = IntegrityCheck {
            mode: IntegrityMode::Signature,
            min_bytes: 1024,
            record: &record,
        };

        fs::write(dir.path().join("0001_a.mp3"), mp3_bytes(2048)).unwrap();
        fs::write(dir.path().join("0002_b.mp3"), mp3_bytes(100)).unwrap();
        fs::write(dir.path().join("0003_c.mp3"), vec![b'<'; 4096]).unwrap();
        fs::write(dir.path().join("0004_d.mp3"), b"").unwrap();

        assert!(matches!(check.classify(dir.path(), &ep(1, "a")), Presence::Present(_)));
        assert_eq!(
            check.classify(dir.path(), &ep(2, "b")),
            Presence::Missing(MissingReason::TooSmall(100))
        );
        assert_eq!(
            check.classify(dir.path(), &ep(3, "c")),
            Presence::Missing(MissingReason::BadSignature)
        );
        assert_eq!(
            check.classify(dir.path(), &ep(4, "d")),
            Presence::Missing(MissingReason::TooSmall(0))
        );
        assert_eq!(
            check.classify(dir.path(), &ep(5, "e")),
            Presence::Missing(MissingReason::NoFile)
        );
    }

    #[test]
    fn renamed_title_is_found_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0007_旧标题.m4a"), b"x").unwrap();
        fs::write(dir.path().join("0007_旧标题.part"), b"x").unwrap();
        let found = find_episode_file(dir.path(), &ep(7, "新标题")).unwrap();
        assert!(found.ends_with("0007_旧标题.m4a"));
        assert!(find_episode_file(dir.path(), &ep(70, "x")).is_none());
    }

    #[test]
    fn hash_mode_needs_matching_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001_a.mp3");
        fs::write(&path, mp3_bytes(2048)).unwrap();

        let mut record = DownloadRecord::default();
        let check_without = IntegrityCheck {
            mode: IntegrityMode::Hash,
            min_bytes: 0,
            record: &record,
        };
        assert_eq!(
            check_without.classify(dir.path(), &ep(1, "a")),
            Presence::Missing(MissingReason::Unrecorded)
        );

        record.upsert(RecordEntry {
            index: 1,
            title: "a".into(),
            file: "0001_a.mp3".into(),
            bytes: 2048,
            sha256: sha256_file(&path).unwrap(),
        });
        let check = IntegrityCheck {
            mode: IntegrityMode::Hash,
            min_bytes: 0,
            record: &record,
        };
        assert!(matches!(check.classify(dir.path(), &ep(1, "a")), Presence::Present(_)));

        fs::write(&path, mp3_bytes(4096)).unwrap();
        assert_eq!(
            check.classify(dir.path(), &ep(1, "a")),
            Presence::Missing(MissingReason::HashMismatch)
        );
    }

    #[test]
    fn stale_files_for_same_index_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("0002_b.m4a");
        fs::write(&keep, b"new").unwrap();
        fs::write(dir.path().join("0002_b.mp3"), b"old").unwrap();
        fs::write(dir.path().join("0020_x.mp3"), b"other").unwrap();
        remove_other_episode_files(dir.path(), 2, &keep).unwrap();
        assert!(keep.exists());
        assert!(!dir.path().join("0002_b.mp3").exists());
        assert!(dir.path().join("0020_x.mp3").exists());
    }
}
