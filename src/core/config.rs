use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keys are lowercase and grouped by concern. Every group falls back to its defaults on its own,
/// so a broken `[install]` table never discards valid `[signing]` settings.
pub const CONFIG_FILE: &str = "/etc/apk-installer/apk-installer.toml";

pub const MIN_KEY_BITS: usize = 1024;
pub const RECOMMENDED_KEY_BITS: usize = 2048;
pub const MAX_VALIDITY_YEARS: u32 = 100;

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct InstallerConfig {
    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SigningConfig {
    /// PEM file with the `PRIVATE KEY` and `CERTIFICATE` blocks. Unset keeps the key in memory only.
    #[serde(default)]
    pub keystore: Option<PathBuf>,
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    #[serde(default = "default_validity_years")]
    pub validity_years: u32,
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_country")]
    pub country: String,
    /// Makes key generation reproducible for a given device/application instance.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_key_bits() -> usize {
    RECOMMENDED_KEY_BITS
}

fn default_validity_years() -> u32 {
    25
}

fn default_common_name() -> String {
    "APK Installer".to_string()
}

fn default_organization() -> String {
    "APK Store".to_string()
}

fn default_country() -> String {
    "US".to_string()
}

fn default_created_by() -> String {
    format!("apk-installer {}", VERSION)
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keystore: None,
            key_bits: default_key_bits(),
            validity_years: default_validity_years(),
            common_name: default_common_name(),
            organization: default_organization(),
            country: default_country(),
            seed: None,
            created_by: default_created_by(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstallConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_verify_package_identity")]
    pub verify_package_identity: bool,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("apk-installer")
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_completion_timeout_secs() -> u64 {
    300
}

fn default_verify_package_identity() -> bool {
    true
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            chunk_size: default_chunk_size(),
            completion_timeout_secs: default_completion_timeout_secs(),
            verify_package_identity: default_verify_package_identity(),
        }
    }
}

impl InstallConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing.key_bits < MIN_KEY_BITS {
            return Err(ConfigError::Invalid {
                key: "signing.key_bits",
                reason: format!("must be at least {}", MIN_KEY_BITS),
            });
        }
        if self.signing.key_bits < RECOMMENDED_KEY_BITS {
            log::warn!(
                "signing.key_bits = {} is below the recommended {}",
                self.signing.key_bits,
                RECOMMENDED_KEY_BITS
            );
        }
        if !(1..=MAX_VALIDITY_YEARS).contains(&self.signing.validity_years) {
            return Err(ConfigError::Invalid {
                key: "signing.validity_years",
                reason: format!("must be between 1 and {}", MAX_VALIDITY_YEARS),
            });
        }
        if self.install.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "install.chunk_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Resets each out-of-range value to its default, leaving the rest untouched.
    fn repair(&mut self) {
        while let Err(ConfigError::Invalid { key, reason }) = self.validate() {
            log::warn!("invalid value for `{}`: {}, using the default", key, reason);
            match key {
                "signing.key_bits" => self.signing.key_bits = default_key_bits(),
                "signing.validity_years" => self.signing.validity_years = default_validity_years(),
                "install.chunk_size" => self.install.chunk_size = default_chunk_size(),
                _ => break,
            }
        }
    }
}

/// Strict loading: any read, parse or range problem is reported.
pub fn load_config(path: impl AsRef<Path>) -> Result<InstallerConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str::<InstallerConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Lenient loading: a missing file yields the defaults. A group that fails to parse falls back
/// to its defaults alone, and out-of-range values are reset one by one, so a valid `keystore`
/// survives a broken `[install]` table.
pub fn parse_config(path: impl AsRef<Path>) -> InstallerConfig {
    let path = path.as_ref();
    let Ok(content) = fs::read_to_string(path) else {
        return InstallerConfig::default();
    };
    let table = match content.parse::<toml::Table>() {
        Ok(table) => table,
        Err(err) => {
            log::warn!(
                "failed to parse {}: {}, falling back to the default config",
                path.display(),
                err
            );
            return InstallerConfig::default();
        }
    };
    let mut config = InstallerConfig {
        signing: group(&table, "signing", path),
        install: group(&table, "install", path),
    };
    config.repair();
    config
}

fn group<T: Default + serde::de::DeserializeOwned>(
    table: &toml::Table,
    name: &str,
    path: &Path,
) -> T {
    match table.get(name).cloned().map(|value| value.try_into::<T>()) {
        None => T::default(),
        Some(Ok(group)) => group,
        Some(Err(err)) => {
            log::warn!(
                "invalid [{}] in {}: {}, using its defaults",
                name,
                path.display(),
                err
            );
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn with_config_file(content: &str, f: impl Fn(PathBuf)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/apk-installer");
        fs::create_dir_all(&path).unwrap();
        let file_path = path.join("apk-installer.toml");
        fs::write(&file_path, content).unwrap();
        f(file_path)
    }

    #[test]
    fn should_read_all_groups() {
        with_config_file(
            r#"
                [signing]
                keystore = "/data/local/tmp/signing.pem"
                key_bits = 4096
                common_name = "Device Signer"
                seed = "device-1:app.example"

                [install]
                work_dir = "/data/local/tmp/work"
                chunk_size = 8192
                completion_timeout_secs = 30
                verify_package_identity = false
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(
                    config.signing.keystore,
                    Some(PathBuf::from("/data/local/tmp/signing.pem"))
                );
                assert_eq!(config.signing.key_bits, 4096);
                assert_eq!(config.signing.common_name, "Device Signer");
                assert_eq!(config.signing.organization, "APK Store");
                assert_eq!(config.signing.seed.as_deref(), Some("device-1:app.example"));
                assert_eq!(config.install.work_dir, PathBuf::from("/data/local/tmp/work"));
                assert_eq!(config.install.chunk_size, 8192);
                assert_eq!(config.install.completion_timeout(), Duration::from_secs(30));
                assert!(!config.install.verify_package_identity);
            },
        );
    }

    #[test]
    fn should_keep_valid_groups_when_one_is_missing() {
        with_config_file(
            r#"
                [install]
                chunk_size = 1024
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.install.chunk_size, 1024);
                assert_eq!(config.signing, SigningConfig::default());
            },
        );
    }

    #[test]
    fn should_fall_back_to_defaults_on_malformed_file() {
        with_config_file("[signing\nkey_bits = ", |path| {
            assert_eq!(parse_config(&path), InstallerConfig::default());
            assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
        });
    }

    #[test]
    fn should_reject_weak_keys_and_empty_chunks() {
        with_config_file("[signing]\nkey_bits = 512\n", |path| {
            assert!(matches!(
                load_config(&path),
                Err(ConfigError::Invalid { key: "signing.key_bits", .. })
            ));
        });
        with_config_file("[install]\nchunk_size = 0\n", |path| {
            assert!(matches!(
                load_config(&path),
                Err(ConfigError::Invalid { key: "install.chunk_size", .. })
            ));
            assert_eq!(parse_config(&path), InstallerConfig::default());
        });
        with_config_file("[signing]\nvalidity_years = 4000000\n", |path| {
            assert!(matches!(
                load_config(&path),
                Err(ConfigError::Invalid { key: "signing.validity_years", .. })
            ));
            assert_eq!(parse_config(&path).signing.validity_years, 25);
        });
    }

    #[test]
    fn should_keep_the_keystore_when_other_values_are_out_of_range() {
        with_config_file(
            r#"
                [signing]
                keystore = "/data/local/tmp/signing.pem"
                key_bits = 512

                [install]
                chunk_size = 0
                completion_timeout_secs = 45
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(
                    config.signing.keystore,
                    Some(PathBuf::from("/data/local/tmp/signing.pem"))
                );
                assert_eq!(config.signing.key_bits, RECOMMENDED_KEY_BITS);
                assert_eq!(config.install.chunk_size, 64 * 1024);
                assert_eq!(config.install.completion_timeout_secs, 45);
                assert!(config.validate().is_ok());
            },
        );
    }

    #[test]
    fn should_keep_the_signing_group_when_install_is_mistyped() {
        with_config_file(
            r#"
                [signing]
                keystore = "/data/local/tmp/signing.pem"

                [install]
                chunk_size = "large"
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(
                    config.signing.keystore,
                    Some(PathBuf::from("/data/local/tmp/signing.pem"))
                );
                assert_eq!(config.install, InstallConfig::default());
            },
        );
    }

    #[test]
    fn should_use_defaults_when_file_is_missing() {
        let dir = tempdir().unwrap();
        let config = parse_config(dir.path().join("missing.toml"));
        assert_eq!(config, InstallerConfig::default());
        assert!(config.validate().is_ok());
    }
}
