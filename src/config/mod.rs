use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "Quotebook";
const APP_NAME: &str = "quotebook";
const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "quotes.db";

pub const CONFIG_ENV: &str = "QUOTEBOOK_CONFIG";
pub const DATA_ENV: &str = "QUOTEBOOK_DATA";

/// Locations given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl PathOverrides {
    /// Fills whatever is still unset from `QUOTEBOOK_CONFIG` and `QUOTEBOOK_DATA`.
    pub fn or_env(self) -> Self {
        let from_env = |key: &str| env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            config_file: self.config_file.or_else(|| from_env(CONFIG_ENV)),
            data_dir: self.data_dir.or_else(|| from_env(DATA_ENV)),
        }
    }
}

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover(overrides: PathOverrides) -> Result<Self> {
        let paths = ConfigPaths::resolve(overrides.or_env())?;
        Ok(Self { paths })
    }

    pub fn from_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Loads the config file, writing the defaults first if there is none.
    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        let path = &self.paths.config_file;
        if path.exists() {
            return self.load();
        }
        let mut cfg = AppConfig::default();
        let toml = toml::to_string_pretty(&cfg).context("serializing default config")?;
        fs::write(path, toml).with_context(|| format!("writing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote default config");
        cfg.post_load(&self.paths);
        Ok(cfg)
    }

    pub fn load(&self) -> Result<AppConfig> {
        let path = &self.paths.config_file;
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.post_load(&self.paths);
        Ok(cfg)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
}

impl ConfigPaths {
    /// Overrides are used as given; XDG directories are only looked up for
    /// what is left unset.
    pub fn resolve(overrides: PathOverrides) -> Result<Self> {
        let project_dirs = || {
            ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
                .context("resolving XDG project directories")
        };
        let config_file = match overrides.config_file {
            Some(path) => path,
            None => project_dirs()?.config_dir().join(CONFIG_FILE_NAME),
        };
        let data_dir = match overrides.data_dir {
            Some(dir) => dir,
            None => project_dirs()?.data_dir().to_path_buf(),
        };
        Ok(Self {
            database_path: data_dir.join(DATABASE_FILE_NAME),
            config_file,
            data_dir,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        let config_dir = self.config_file.parent().filter(|dir| !dir.as_os_str().is_empty());
        for dir in config_dir.into_iter().chain([self.data_dir.as_path()]) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageOptions,
    pub submit: SubmitOptions,
    pub duplicates: DuplicateOptions,
    pub search: SearchOptions,
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) {
        self.storage.resolve(paths);
        if self.duplicates.max_results == 0 {
            tracing::warn!("duplicates.max_results is 0 in config, falling back to default");
            self.duplicates.max_results = DuplicateOptions::default().max_results;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitOptions {
    /// Store new drafts verbatim, skipping timestamp and nick detection.
    pub preserve_formatting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateOptions {
    pub max_results: usize,
}

impl Default for DuplicateOptions {
    fn default() -> Self {
        Self { max_results: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_results: 200 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths_in(root: &TempDir) -> anyhow::Result<ConfigPaths> {
        ConfigPaths::resolve(PathOverrides {
            config_file: Some(root.path().join("config").join("quotebook.toml")),
            data_dir: Some(root.path().join("data")),
        })
    }

    #[test]
    fn overrides_are_used_verbatim() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let paths = paths_in(&temp)?;
        assert_eq!(paths.config_file, temp.path().join("config/quotebook.toml"));
        assert_eq!(paths.database_path, temp.path().join("data/quotes.db"));

        paths.ensure_directories()?;
        assert!(temp.path().join("config").is_dir());
        assert!(temp.path().join("data").is_dir());
        Ok(())
    }

    #[test]
    fn explicit_overrides_win_over_the_environment() {
        let explicit = PathOverrides {
            config_file: Some(PathBuf::from("/tmp/explicit.toml")),
            data_dir: Some(PathBuf::from("/tmp/explicit-data")),
        };
        let merged = explicit.or_env();
        assert_eq!(merged.config_file, Some(PathBuf::from("/tmp/explicit.toml")));
        assert_eq!(merged.data_dir, Some(PathBuf::from("/tmp/explicit-data")));
    }

    #[test]
    fn first_load_writes_defaults() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let loader = ConfigLoader::from_paths(paths_in(&temp)?);
        let cfg = loader.load_or_init()?;
        assert!(loader.paths().config_file.exists());
        assert_eq!(cfg.storage.database_path, loader.paths().database_path);
        assert_eq!(cfg.duplicates.max_results, 10);

        let reloaded = loader.load()?;
        assert_eq!(reloaded.storage.wal_autocheckpoint, 1000);
        Ok(())
    }

    #[test]
    fn partial_config_keeps_defaults() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let paths = paths_in(&temp)?;
        paths.ensure_directories()?;
        fs::write(
            &paths.config_file,
            "[submit]\npreserve_formatting = true\n\n[duplicates]\nmax_results = 0\n",
        )?;
        let cfg = ConfigLoader::from_paths(paths).load()?;
        assert!(cfg.submit.preserve_formatting);
        assert_eq!(cfg.duplicates.max_results, 10);
        assert_eq!(cfg.search.max_results, 200);
        Ok(())
    }
}
