//! 配置文件读写与带注释生成。
//!
//! 用户文件里缺失的字段会用默认值补齐并回写，已有字段保持不变。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    fn fields() -> &'static [FieldMeta];

    /// 加载后的语义校验；默认不做额外限制。
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

pub fn load_or_create<T: ConfigSpec>(config_path: Option<&Path>) -> Result<T, ConfigError> {
    load_or_create_with_base::<T>(config_path, None)
}

/// 读取配置；文件不存在时写出带注释的默认配置。
///
/// 路径解析：`config_path` 优先，其次 `base_dir/FILE_NAME`，最后是当前目录下的 `FILE_NAME`。
pub fn load_or_create_with_base<T: ConfigSpec>(
    config_path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<T, ConfigError> {
    let path = resolve_path::<T>(config_path, base_dir);
    ensure_parent(&path)?;

    if !path.exists() {
        let default_config = T::default();
        write_with_comments(&default_config, &path)?;
        return Ok(default_config);
    }

    let user_yaml = read_yaml(&path)?;
    let missing = missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    merge_values(&mut merged, user_yaml);

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;
    config.validate().map_err(ConfigError::Validation)?;

    if !missing.is_empty() {
        tracing::info!(target: "startup", missing = ?missing, "配置文件缺少字段，已用默认值补齐");
        write_with_comments(&config, &path)?;
    }

    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = generate_yaml_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_yaml_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let value =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?;
    let Value::Mapping(mapping) = value else {
        return Err(ConfigError::Validation(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut blocks = Vec::with_capacity(T::fields().len());
    for field in T::fields() {
        let mut block = String::new();
        for line in field.description.lines().filter(|l| !l.is_empty()) {
            block.push_str("# ");
            block.push_str(line);
            block.push('\n');
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let single = Mapping::from_iter([(key, val)]);
        let yaml_line = serde_yaml::to_string(&single)
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        block.push_str(yaml_line.trim_end());
        blocks.push(block);
    }

    Ok(blocks.join("\n"))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn missing_fields<T: ConfigSpec>(user_yaml: &Value) -> Vec<&'static str> {
    let Value::Mapping(map) = user_yaml else {
        return T::fields().iter().map(|f| f.name).collect();
    };
    T::fields()
        .iter()
        .filter(|f| !map.contains_key(Value::String(f.name.to_string())))
        .map(|f| f.name)
        .collect()
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                match dest.get_mut(&key) {
                    Some(dest_val) => merge_values(dest_val, user_val),
                    None => {
                        dest.insert(key, user_val);
                    }
                }
            }
        }
        // 空值（用户写了 `key:` 但没填）保留默认值
        (_, Value::Null) => {}
        (dest, other) => *dest = other,
    }
}

fn resolve_path<T: ConfigSpec>(path: Option<&Path>, base_dir: Option<&Path>) -> PathBuf {
    match (path, base_dir) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(base)) => base.join(T::FILE_NAME),
        (None, None) => PathBuf::from(T::FILE_NAME),
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        workers: usize,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                workers: 3,
                name: "demo".to_string(),
            }
        }
    }

    impl ConfigSpec for Sample {
        const FILE_NAME: &'static str = "sample.yml";

        fn fields() -> &'static [FieldMeta] {
            static FIELDS: [FieldMeta; 2] = [
                FieldMeta {
                    name: "workers",
                    description: "并发数",
                },
                FieldMeta {
                    name: "name",
                    description: "名称",
                },
            ];
            &FIELDS
        }

        fn validate(&self) -> Result<(), String> {
            if self.workers == 0 {
                return Err("workers must be >= 1".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn creates_commented_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Sample = load_or_create_with_base(None, Some(dir.path())).unwrap();
        assert_eq!(cfg, Sample::default());

        let text = fs::read_to_string(dir.path().join("sample.yml")).unwrap();
        assert!(text.contains("# 并发数\nworkers: 3"));
        assert!(text.contains("# 名称\nname: demo"));
    }

    #[test]
    fn fills_missing_fields_and_keeps_user_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "workers: 8\n").unwrap();

        let cfg: Sample = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.name, "demo");

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("name: demo"));
        assert!(text.contains("workers: 8"));
    }

    #[test]
    fn rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "workers: 0\nname: x\n").unwrap();

        let err = load_or_create::<Sample>(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
