use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_READ_TIMEOUT_S: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Supabase,
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub storage_url: String,
    #[serde(default)]
    pub api_key: String,
    pub bucket: String,
    #[serde(default)]
    pub directory_path: Option<PathBuf>,
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    #[serde(default = "default_read_timeout_s")]
    pub archive_read_timeout_s: u64,
    /// No local filesystem beyond the store itself: downloads never create
    /// parent directories.
    #[serde(default)]
    pub storage_only: bool,
    #[serde(default)]
    pub mandatory_subfolders: Vec<String>,
}

fn default_read_timeout_s() -> u64 {
    DEFAULT_READ_TIMEOUT_S
}

impl SyncConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: SyncConfig = toml::from_str(content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill credentials that the file leaves empty from the environment.
    fn apply_env(&mut self) {
        if self.storage_url.is_empty() {
            self.storage_url = std::env::var("SUPABASE_URL").unwrap_or_default();
        }
        if self.api_key.is_empty() {
            self.api_key = std::env::var("SUPABASE_KEY")
                .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
                .unwrap_or_default();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.trim().is_empty() {
            anyhow::bail!("bucket must not be empty");
        }
        if self.archive_read_timeout_s == 0 {
            anyhow::bail!("archive_read_timeout_s must be positive");
        }
        match self.backend {
            BackendKind::Supabase => {
                if self.storage_url.is_empty() {
                    anyhow::bail!("storage_url must not be empty (or set SUPABASE_URL)");
                }
                if !self.storage_url.starts_with("http://") && !self.storage_url.starts_with("https://") {
                    anyhow::bail!("storage_url must be an http(s) URL: {}", self.storage_url);
                }
                if self.api_key.is_empty() {
                    anyhow::bail!("api_key must not be empty (or set SUPABASE_KEY)");
                }
            }
            BackendKind::Directory => match &self.directory_path {
                Some(p) if p.is_absolute() => {}
                Some(p) => anyhow::bail!("directory_path must be absolute: {}", p.display()),
                None => anyhow::bail!("directory_path is required for the directory backend"),
            },
        }
        for name in &self.mandatory_subfolders {
            if name.trim_matches('/').is_empty() || name.contains("..") {
                anyhow::bail!("invalid mandatory subfolder name: {:?}", name);
            }
        }
        Ok(())
    }

    pub fn archive_read_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_read_timeout_s)
    }

    /// Where downloaded archives land when the caller picks no directory.
    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir.clone().unwrap_or_else(default_downloads_dir)
    }
}

/// The user's downloads directory, or the working directory when no home
/// directory is known.
pub fn default_downloads_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_supabase_config() {
        let toml_str = r#"
storage_url = "https://abc.supabase.co"
api_key = "anon-key"
bucket = "clientes"
mandatory_subfolders = ["GERAL", "Contratos"]
"#;
        let config = SyncConfig::parse(toml_str).unwrap();
        assert_eq!(config.backend, BackendKind::Supabase);
        assert_eq!(config.archive_read_timeout(), Duration::from_secs(300));
        assert!(!config.storage_only);
        assert_eq!(config.mandatory_subfolders.len(), 2);
    }

    #[test]
    fn test_parse_directory_config() {
        let toml_str = r#"
backend = "directory"
bucket = "local"
directory_path = "/var/lib/clientstore"
downloads_dir = "/tmp/out"
archive_read_timeout_s = 60
"#;
        let config = SyncConfig::parse(toml_str).unwrap();
        assert_eq!(config.backend, BackendKind::Directory);
        assert_eq!(config.downloads_dir(), PathBuf::from("/tmp/out"));
        assert_eq!(config.archive_read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_relative_directory_rejected() {
        let toml_str = r#"
backend = "directory"
bucket = "local"
directory_path = "relative/path"
"#;
        assert!(SyncConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let toml_str = r#"
storage_url = "https://abc.supabase.co"
api_key = "k"
bucket = " "
"#;
        assert!(SyncConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_bad_subfolder_rejected() {
        let toml_str = r#"
storage_url = "https://abc.supabase.co"
api_key = "k"
bucket = "b"
mandatory_subfolders = ["../escape"]
"#;
        assert!(SyncConfig::parse(toml_str).is_err());
    }
}
