use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub const CONFIG_FILE_NAME: &str = "openbis-seek-bridge.json";
pub const OPENBIS_PASSWORD_VAR: &str = "OPENBIS_PASSWORD";
pub const SEEK_PASSWORD_VAR: &str = "SEEK_PASSWORD";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub openbis: OpenbisSection,
    #[serde(default)]
    pub seek: SeekSection,
    #[serde(default)]
    pub attributes: AttributeSection,
    #[serde(default)]
    pub mappings_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OpenbisSection {
    #[serde(default)]
    pub as_url: Option<String>,
    #[serde(default)]
    pub dss_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Base URL of the openBIS web UI that deep links are built from.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SeekSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub default_project: Option<String>,
    #[serde(default)]
    pub default_study: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AttributeSection {
    #[serde(default)]
    pub sample_title: Option<String>,
    #[serde(default)]
    pub registration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenbisSettings {
    pub as_url: String,
    pub dss_url: String,
    pub user: String,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekSettings {
    pub url: String,
    pub user: String,
    pub default_project: String,
    pub default_study: String,
}

/// Names of the two attributes every translated sample carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNames {
    pub sample_title: String,
    pub registration_date: String,
}

/// Validated, immutable configuration for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub openbis: OpenbisSettings,
    pub seek: SeekSettings,
    pub attributes: AttributeNames,
    pub mappings_dir: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BridgeError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Self::default_path().ok_or(BridgeError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BridgeError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BridgeError::ConfigParse(err.to_string()))?;

        let base_dir = config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();
        Self::resolve_config(config, &base_dir)
    }

    /// `openbis-seek-bridge.json` in the working directory, else the per-user config file.
    fn default_path() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "openbis-seek-bridge")
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.json")).ok())
            .filter(|path| path.exists())
    }

    pub fn resolve_config(
        config: Config,
        base_dir: &Utf8Path,
    ) -> Result<ResolvedConfig, BridgeError> {
        let openbis = OpenbisSettings {
            as_url: required(config.openbis.as_url, "openbis.as_url")?,
            dss_url: required(config.openbis.dss_url, "openbis.dss_url")?,
            user: required(config.openbis.user, "openbis.user")?,
            base_url: required(config.openbis.base_url, "openbis.base_url")?,
        };
        let seek = SeekSettings {
            url: required(config.seek.url, "seek.url")?,
            user: required(config.seek.user, "seek.user")?,
            default_project: required(config.seek.default_project, "seek.default_project")?,
            default_study: required(config.seek.default_study, "seek.default_study")?,
        };
        let attributes = AttributeNames {
            sample_title: required(config.attributes.sample_title, "attributes.sample_title")?,
            registration_date: required(
                config.attributes.registration_date,
                "attributes.registration_date",
            )?,
        };

        let mappings_dir = Utf8PathBuf::from(
            config
                .mappings_dir
                .filter(|dir| !dir.trim().is_empty())
                .unwrap_or_else(|| "mappings".to_string()),
        );
        let mappings_dir = if mappings_dir.is_absolute() {
            mappings_dir
        } else {
            base_dir.join(mappings_dir)
        };

        Ok(ResolvedConfig {
            openbis,
            seek,
            attributes,
            mappings_dir,
        })
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, BridgeError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(BridgeError::MissingConfigValue(key.to_string())),
    }
}

/// Reads a password from the environment; blank values count as missing.
pub fn credential_from_env(var: &str) -> Result<String, BridgeError> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| BridgeError::MissingCredential(var.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn full_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "openbis": {
                "as_url": "https://openbis.example.org",
                "dss_url": "https://openbis.example.org",
                "user": "reader",
                "base_url": "https://openbis.example.org/openbis/webapp/eln-lims/"
            },
            "seek": {
                "url": "https://seek.example.org",
                "user": "writer",
                "default_project": "1",
                "default_study": "2"
            },
            "attributes": {
                "sample_title": "openBIS Name",
                "registration_date": "Registration Date"
            }
        }))
        .unwrap()
    }

    #[test]
    fn mappings_dir_defaults_next_to_config() {
        let resolved =
            ConfigLoader::resolve_config(full_config(), Utf8Path::new("/etc/bridge")).unwrap();
        assert_eq!(resolved.mappings_dir, Utf8PathBuf::from("/etc/bridge/mappings"));
        assert_eq!(resolved.seek.default_project, "1");
    }

    #[test]
    fn missing_default_project_is_rejected() {
        let mut config = full_config();
        config.seek.default_project = Some("  ".to_string());
        let err = ConfigLoader::resolve_config(config, Utf8Path::new(".")).unwrap_err();
        assert_matches!(err, BridgeError::MissingConfigValue(key) if key == "seek.default_project");
    }
}
