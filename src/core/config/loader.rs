use anyhow::{Context, Result};
use dirs_next as dirs;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use super::model::OrchestratorConfig;

const APP_IDENTIFIER: &str = "tunnel-orchestrator";
const CONFIG_FILE_NAME: &str = "orchestrator.json";

fn join_default_path(base: &Path) -> PathBuf {
    let mut p = base.to_path_buf();
    p.push("config");
    p.push(CONFIG_FILE_NAME);
    p
}

/// 默认配置基目录：
/// Windows: %APPDATA%\tunnel-orchestrator
/// macOS: ~/Library/Application Support/tunnel-orchestrator
/// Linux: ~/.config/tunnel-orchestrator
pub fn default_base_dir() -> PathBuf {
    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_IDENTIFIER);
        dir
    } else {
        // 极端环境下获取失败，才回退到当前目录
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

/// 返回基目录下的配置文件路径。
pub fn config_path_at(base_dir: &Path) -> PathBuf {
    join_default_path(base_dir)
}

pub fn load_or_init() -> Result<OrchestratorConfig> {
    load_or_init_at(&default_base_dir())
}

pub fn load_or_init_at(base_dir: &Path) -> Result<OrchestratorConfig> {
    let path = join_default_path(base_dir);
    load_or_init_at_path(&path)
}

pub fn save_at(cfg: &OrchestratorConfig, base_dir: &Path) -> Result<()> {
    let path = join_default_path(base_dir);
    save_at_path(cfg, &path)
}

fn load_or_init_at_path(path: &Path) -> Result<OrchestratorConfig> {
    if path.exists() {
        let data = fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let cfg: OrchestratorConfig =
            serde_json::from_slice(&data).context("parse orchestrator config json")?;
        tracing::debug!(target = "config", path = %path.display(), "config loaded");
        Ok(cfg)
    } else {
        let cfg = OrchestratorConfig::default();
        save_at_path(&cfg, path)?;
        Ok(cfg)
    }
}

fn save_at_path(cfg: &OrchestratorConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("create config dir: {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(cfg).context("serialize config")?;
    let mut f =
        fs::File::create(path).with_context(|| format!("create config: {}", path.display()))?;
    f.write_all(json.as_bytes()).context("write config")?;
    tracing::info!(target = "config", path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_or_init_at(dir.path()).expect("load config");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert!(config_path_at(dir.path()).exists());
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = OrchestratorConfig::default();
        cfg.batch.concurrency = 3;
        cfg.scoring.preferred_protocols = vec!["vless".into()];
        save_at(&cfg, dir.path()).expect("save config");
        let loaded = load_or_init_at(dir.path()).expect("reload config");
        assert_eq!(loaded.batch.concurrency, 3);
        assert_eq!(loaded.scoring.preferred_protocols, vec!["vless".to_string()]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_at(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        assert!(load_or_init_at(dir.path()).is_err());
    }

    #[test]
    fn unwritable_config_dir_names_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        // 基目录是普通文件，无法在其下创建 config 目录
        let base = dir.path().join("occupied");
        fs::write(&base, b"file").unwrap();
        let err = save_at(&OrchestratorConfig::default(), &base).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("create config dir"), "unexpected error: {msg}");
        assert!(msg.contains("occupied"), "unexpected error: {msg}");
    }
}
