//! 临时文件清理。

use std::fs;
use std::io;
use std::path::Path;

pub fn is_empty_dir(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = path.as_ref();
    let mut entries = fs::read_dir(path)?;
    Ok(entries.next().is_none())
}

/// 删除目录下残留的 `.part` 文件（上次运行中断留下的半成品），返回删除数量。
///
/// 只应在没有任务写入该目录时调用。
pub fn remove_stale_parts(dir: impl AsRef<Path>) -> io::Result<usize> {
    let dir = dir.as_ref();
    let Ok(rd) = fs::read_dir(dir) else {
        return Ok(0);
    };
    let mut removed = 0;
    for entry in rd.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_part = entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && path
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.eq_ignore_ascii_case("part"))
                .unwrap_or(false);
        if !is_part {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    if removed > 0 {
        tracing::debug!(target: "plan", dir = %dir.display(), removed, "removed stale .part files");
    }
    Ok(removed)
}
