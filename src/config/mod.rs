pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{Config, DnsConfig, FakeIpConfig, LogConfig, Strategy};

/// 读取、解析并校验配置文件
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config {}", path))?;
    let config: Config =
        serde_yml::from_str(&content).with_context(|| format!("failed to parse config {}", path))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "log:\n  level: warn\ndns:\n  servers:\n    - udp://127.0.0.1:5353\n    - localhost\n",
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.dns.servers, vec!["udp://127.0.0.1:5353", "localhost"]);
    }

    #[test]
    fn load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "dns:\n  servers: []\n").unwrap();
        assert!(load_config(path.to_str().unwrap()).is_err());
        assert!(load_config(dir.path().join("missing.yaml").to_str().unwrap()).is_err());
    }
}
