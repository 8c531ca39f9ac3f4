use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::MatchMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub authority: Option<AuthorityConfig>,
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
}

/// Remote file store: host, credentials, and the two artifact roots.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Password authentication. Ignored when `private_key` is set.
    #[serde(default)]
    pub password: Option<String>,
    /// Private-key authentication; takes precedence over `password`.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Root directory holding payment-slip PDFs.
    pub slip_root: String,
    /// Root directory holding invoice PDFs. Optional; slips-only stores exist.
    #[serde(default)]
    pub invoice_root: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_match_mode")]
    pub match_mode: MatchMode,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Cap on in-flight authority lookups.
    #[serde(default = "default_lookup_workers")]
    pub lookup_workers: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_extensions(),
            timeout_secs: default_timeout_secs(),
            match_mode: default_match_mode(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            lookup_workers: default_lookup_workers(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec![".pdf".to_string()]
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_match_mode() -> MatchMode {
    MatchMode::Substring
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    2_000
}
fn default_lookup_workers() -> usize {
    4
}

/// Tax authority endpoints. All three are required together.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    /// Access-key resolution endpoint (`GET {dps_url}/{derived identifier}`).
    pub dps_url: String,
    /// Record endpoint (`GET {nfse_url}/{access key}`).
    pub nfse_url: String,
    /// PDF-rendering endpoint (`GET {danfse_url}/{access key}`).
    pub danfse_url: String,
    /// Authority-internal identifier prefix prepended to the padded number.
    pub dps_prefix: String,
}

/// PKCS#12 client certificate for mutual TLS against the authority.
#[derive(Debug, Deserialize, Clone)]
pub struct CertificateConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MatcherConfig {
    /// Let authority-sourced customer names overwrite PDF-extracted ones.
    #[serde(default)]
    pub prefer_authority: bool,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate remote
    if config.remote.host.trim().is_empty() {
        anyhow::bail!("remote.host must not be empty");
    }
    if config.remote.user.trim().is_empty() {
        anyhow::bail!("remote.user must not be empty");
    }
    if config.remote.password.is_none() && config.remote.private_key.is_none() {
        anyhow::bail!("remote requires either password or private_key");
    }
    if config.remote.slip_root.trim().is_empty() {
        anyhow::bail!("remote.slip_root must not be empty");
    }

    // Validate search
    if config.search.allowed_extensions.is_empty() {
        anyhow::bail!("search.allowed_extensions must not be empty");
    }
    if config.search.lookup_workers == 0 {
        anyhow::bail!("search.lookup_workers must be >= 1");
    }
    if config.search.reconnect_attempts == 0 {
        anyhow::bail!("search.reconnect_attempts must be >= 1");
    }

    // Validate authority endpoints when the section is present
    if let Some(ref authority) = config.authority {
        for (field, value) in [
            ("authority.dps_url", &authority.dps_url),
            ("authority.nfse_url", &authority.nfse_url),
            ("authority.danfse_url", &authority.danfse_url),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let file = write_config(
            r#"
[remote]
host = "files.example.com"
user = "svc"
password = "secret"
slip_root = "/boletos"
"#,
        );
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.remote.port, 22);
        assert_eq!(cfg.search.allowed_extensions, vec![".pdf"]);
        assert_eq!(cfg.search.match_mode, MatchMode::Substring);
        assert!(cfg.authority.is_none());
        assert!(!cfg.matcher.prefer_authority);
    }

    #[test]
    fn missing_credentials_rejected() {
        let file = write_config(
            r#"
[remote]
host = "files.example.com"
user = "svc"
slip_root = "/boletos"
"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("password or private_key"));
    }

    #[test]
    fn empty_authority_url_rejected() {
        let file = write_config(
            r#"
[remote]
host = "files.example.com"
user = "svc"
password = "secret"
slip_root = "/boletos"

[authority]
dps_url = ""
nfse_url = "https://api.example.gov/nfse"
danfse_url = "https://api.example.gov/danfse"
dps_prefix = "DPS123"
"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("dps_url"));
    }

    #[test]
    fn literal_match_mode_parses() {
        let file = write_config(
            r#"
[remote]
host = "files.example.com"
user = "svc"
password = "secret"
slip_root = "/boletos"

[search]
match_mode = "literal"
"#,
        );
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.search.match_mode, MatchMode::Literal);
    }
}
