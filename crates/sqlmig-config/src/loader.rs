use std::path::{Path, PathBuf};

use sqlmig_common::{Error, Result};
use tracing::{debug, info};

use crate::model::ProjectConfig;

/// File names looked up in the project root, in order.
const CANDIDATES: &[&str] = &["sqlmig.yml", "sqlmig.yaml", "sqlmig.toml"];

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the config for the project at `root`.
    ///
    /// An explicit `path` must exist. Without one, the first candidate file
    /// found in `root` is used, and defaults apply when there is none. The
    /// returned config has its paths resolved against `root`.
    pub fn load(root: &Path, path: Option<&Path>) -> Result<ProjectConfig> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::discover(root) {
                Some(found) => Self::from_file(&found)?,
                None => {
                    debug!("no config file in {}, using defaults", root.display());
                    ProjectConfig::default()
                }
            },
        };
        Ok(config.resolve(root))
    }

    pub fn discover(root: &Path) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|name| root.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn from_file(path: &Path) -> Result<ProjectConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }
}
