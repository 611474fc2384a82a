use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.port_range.start == 0 || cfg.port_range.end < cfg.port_range.start {
        return Err(ProxyError::Config(format!(
            "invalid port_range [{}, {}]",
            cfg.port_range.start, cfg.port_range.end
        )));
    }

    if !Path::new(&cfg.tls.cert_path).exists() {
        return Err(ProxyError::Config(format!(
            "certificate file not found: {}",
            cfg.tls.cert_path
        )));
    }
    if !Path::new(&cfg.tls.key_path).exists() {
        return Err(ProxyError::Config(format!("key file not found: {}", cfg.tls.key_path)));
    }

    if let Some(parent) = PathBuf::from(&cfg.save_file).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(ProxyError::Config(format!(
                "save_file directory does not exist: {}",
                parent.display()
            )));
        }
    }

    if let Some(webroot) = &cfg.acme_webroot {
        if !Path::new(webroot).is_dir() {
            return Err(ProxyError::Config(format!("acme_webroot is not a directory: {webroot}")));
        }
    }

    if cfg.api_token.is_empty() {
        return Err(ProxyError::Config("api_token must not be empty".to_string()));
    }

    if cfg.hostname.is_empty() {
        return Err(ProxyError::Config("hostname must not be empty".to_string()));
    }

    Ok(())
}
