//! Client configuration: databrowser host discovery and normalization.
//!
//! The host can be given directly or discovered from config files, first
//! hit wins: the user config dir, the user data dir, `$FREVA_CONFIG`, the
//! system data dir, and finally the legacy `evaluation_system.conf` ini
//! file. Host normalization: split on `://` (default scheme `http`),
//! strip any path, append the API prefix.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "No databrowser host configured, please use a configuration defining a \
         databrowser host or set a host name using the `host` key"
    )]
    NoHost,
    #[error("Could not parse config file content: {0}")]
    Parse(String),
}

/// Path of the API on any databrowser host.
const API_PREFIX: &str = "/api/freva-nextgen";

enum ConfigKind {
    Toml,
    Ini,
}

/// Split a url spec into scheme and the remainder, defaulting to `http`.
fn split_url(url: &str) -> (String, String) {
    match url.split_once("://") {
        Some((scheme, host)) => (scheme.to_string(), host.to_string()),
        None => ("http".to_string(), url.to_string()),
    }
}

/// Normalize a host spec into the databrowser base url.
pub fn databrowser_url(host: &str) -> String {
    let (scheme, host) = split_url(host);
    let host = host.split('/').next().unwrap_or(&host);
    format!("{scheme}://{host}{API_PREFIX}/databrowser")
}

/// `freva.toml`: `[freva] databrowser_host = "…"`.
fn read_toml(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let value: toml::Value = content
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
    let host = value
        .get("freva")
        .and_then(|section| section.get("databrowser_host"))
        .and_then(|host| host.as_str())
        .unwrap_or_default();
    if host.is_empty() {
        return Ok(String::new());
    }
    let (scheme, host) = split_url(host);
    Ok(format!("{scheme}://{host}"))
}

/// Minimal ini reader for the legacy `evaluation_system.conf`: the
/// `[evaluation_system]` section with `databrowser.host`,
/// `databrowser.port` or `solr.host` keys.
fn read_ini(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut section = String::new();
    let mut host = String::new();
    let mut solr_host = String::new();
    let mut port = String::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }
        if section != "evaluation_system" {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "databrowser.host" => host = value.trim().to_string(),
                "solr.host" => solr_host = value.trim().to_string(),
                "databrowser.port" => port = value.trim().to_string(),
                _ => {}
            }
        }
    }
    let raw = if host.is_empty() { solr_host } else { host };
    if raw.is_empty() {
        return Ok(String::new());
    }
    let (scheme, raw) = split_url(&raw);
    let (hostname, existing_port) = raw
        .split_once(':')
        .map(|(h, p)| (h.to_string(), p.to_string()))
        .unwrap_or((raw.clone(), String::new()));
    let port = if existing_port.is_empty() { port } else { existing_port };
    if port.is_empty() {
        Ok(format!("{scheme}://{hostname}"))
    } else {
        Ok(format!("{scheme}://{hostname}:{port}"))
    }
}

/// The config files probed for a databrowser host, in order.
fn config_paths() -> Vec<(PathBuf, ConfigKind)> {
    let mut paths = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        paths.push((config_dir.join("freva").join("freva.toml"), ConfigKind::Toml));
    }
    if let Some(data_dir) = dirs::data_dir() {
        paths.push((data_dir.join("freva").join("freva.toml"), ConfigKind::Toml));
    }
    if let Some(freva_config) = std::env::var_os("FREVA_CONFIG") {
        paths.push((PathBuf::from(freva_config), ConfigKind::Toml));
    }
    let system_data = PathBuf::from("/usr/share/freva");
    paths.push((system_data.join("freva.toml"), ConfigKind::Toml));
    let eval_conf = std::env::var_os("EVALUATION_SYSTEM_CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| system_data.join("evaluation_system.conf"));
    paths.push((eval_conf, ConfigKind::Ini));
    paths
}

/// Find the databrowser host, first config hit wins.
fn host_from_config() -> Result<String, ConfigError> {
    for (path, kind) in config_paths() {
        if !path.is_file() {
            continue;
        }
        let host = match kind {
            ConfigKind::Toml => read_toml(&path),
            ConfigKind::Ini => read_ini(&path),
        }
        .unwrap_or_default();
        if !host.is_empty() {
            return Ok(host);
        }
    }
    Err(ConfigError::NoHost)
}

/// Basic client configuration.
pub struct Config {
    pub databrowser_url: String,
    pub uniq_key: String,
    pub flavour: String,
}

impl Config {
    pub fn new(
        host: Option<&str>,
        uniq_key: &str,
        flavour: &str,
    ) -> Result<Self, ConfigError> {
        let host = match host {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => host_from_config()?,
        };
        Ok(Self {
            databrowser_url: databrowser_url(&host),
            uniq_key: uniq_key.to_string(),
            flavour: flavour.to_string(),
        })
    }

    /// The data search endpoint for this configuration.
    pub fn search_url(&self) -> String {
        format!(
            "{}/data-search/{}/{}",
            self.databrowser_url, self.flavour, self.uniq_key
        )
    }

    /// The metadata search endpoint for this configuration.
    pub fn metadata_url(&self) -> String {
        format!(
            "{}/metadata-search/{}/{}",
            self.databrowser_url, self.flavour, self.uniq_key
        )
    }

    /// The overview endpoint.
    pub fn overview_url(&self) -> String {
        format!("{}/overview", self.databrowser_url)
    }

    /// The token endpoint on the same host.
    pub fn token_url(&self) -> String {
        format!(
            "{}/auth/v2/token",
            self.databrowser_url.trim_end_matches("/databrowser")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_host_normalization() {
        assert_eq!(
            databrowser_url("www.example.org"),
            "http://www.example.org/api/freva-nextgen/databrowser"
        );
        assert_eq!(
            databrowser_url("https://www.example.org:8080/some/path"),
            "https://www.example.org:8080/api/freva-nextgen/databrowser"
        );
    }

    #[test]
    fn test_read_toml_host() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[freva]\ndatabrowser_host = \"example.org:7777\"").unwrap();
        assert_eq!(read_toml(file.path()).unwrap(), "http://example.org:7777");
    }

    #[test]
    fn test_read_toml_without_host() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[freva]\nother = 1").unwrap();
        assert_eq!(read_toml(file.path()).unwrap(), "");
    }

    #[test]
    fn test_read_legacy_ini() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[evaluation_system]\n# legacy config\ndatabrowser.host = example.org\n\
             databrowser.port = 8080"
        )
        .unwrap();
        assert_eq!(read_ini(file.path()).unwrap(), "http://example.org:8080");
    }

    #[test]
    fn test_read_legacy_ini_solr_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[evaluation_system]\nsolr.host = http://solr.example.org").unwrap();
        assert_eq!(read_ini(file.path()).unwrap(), "http://solr.example.org");
    }

    #[test]
    fn test_endpoint_urls() {
        let config = Config::new(Some("example.org"), "file", "cmip6").unwrap();
        assert_eq!(
            config.search_url(),
            "http://example.org/api/freva-nextgen/databrowser/data-search/cmip6/file"
        );
        assert!(config.token_url().ends_with("/api/freva-nextgen/auth/v2/token"));
    }
}
