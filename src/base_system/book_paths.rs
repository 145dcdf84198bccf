use std::path::{Path, PathBuf};

use crate::base_system::context::{Config, safe_fs_name};

/// 可识别的音频扩展名；第一个之外的顺序无意义。
pub const AUDIO_EXTS: [&str; 6] = ["mp3", "m4a", "aac", "ogg", "flac", "wav"];

pub fn book_folder_name(title: &str) -> String {
    safe_fs_name(title, "_", 120)
}

pub fn book_folder_path(config: &Config, title: &str) -> PathBuf {
    config.default_save_dir().join(book_folder_name(title))
}

/// 同一本书内的集文件名前缀，索引唯一，因此不同集永远不会写到同一路径。
pub fn episode_prefix(index: u32) -> String {
    format!("{index:04}_")
}

pub fn episode_stem(index: u32, title: &str) -> String {
    format!("{}{}", episode_prefix(index), safe_fs_name(title, "_", 100))
}

pub fn episode_file_name(index: u32, title: &str, ext: &str) -> String {
    format!("{}.{}", episode_stem(index, title), ext)
}

/// 下载中的临时文件：`<stem>.part`，完成后重命名为正式文件。
pub fn part_path(final_path: &Path) -> PathBuf {
    final_path.with_extension("part")
}

/// 从媒体地址推断扩展名，未知时回退到 `mp3`。
pub fn ext_from_media_url(url: &str) -> &'static str {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    let tail = path.rsplit('.').next().unwrap_or("");
    AUDIO_EXTS
        .iter()
        .find(|ext| **ext == tail)
        .copied()
        .unwrap_or("mp3")
}

pub fn is_audio_ext(ext: &str) -> bool {
    AUDIO_EXTS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_names_are_zero_padded() {
        assert_eq!(episode_file_name(7, "第7集 夜雨", "m4a"), "0007_第7集 夜雨.m4a");
        assert_eq!(episode_stem(1234, "a/b"), "1234_a_b");
    }

    #[test]
    fn ext_detection_ignores_query() {
        assert_eq!(ext_from_media_url("https://x.cdn/a/b.M4A?sign=1"), "m4a");
        assert_eq!(ext_from_media_url("https://x.cdn/a/b.flac#t=1"), "flac");
        assert_eq!(ext_from_media_url("https://x.cdn/stream?id=3"), "mp3");
    }

    #[test]
    fn part_path_replaces_extension() {
        let p = part_path(Path::new("/tmp/book/0001_a.mp3"));
        assert_eq!(p, PathBuf::from("/tmp/book/0001_a.part"));
    }
}
