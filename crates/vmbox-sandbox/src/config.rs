//! Persisted runtime configuration.
//!
//! Loaded once at shim startup and passed to the engine unchanged. The file
//! is TOML, resolved from `VMBOX_CONF` or the conventional locations below.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

const CONFIG_ENV: &str = "VMBOX_CONF";

const DEFAULT_PATHS: &[&str] = &[
    "/etc/vmbox/configuration.toml",
    "/usr/share/defaults/vmbox/configuration.toml",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub hypervisor: HypervisorConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Hypervisor binary.
    pub path: PathBuf,
    pub kernel: PathBuf,
    pub image: PathBuf,
    pub kernel_params: String,
    pub default_vcpus: u32,
    pub default_memory_mb: u32,
    pub debug: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            kernel: PathBuf::new(),
            image: PathBuf::new(),
            kernel_params: String::new(),
            default_vcpus: 1,
            default_memory_mb: 2048,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub dial_timeout_secs: u64,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Load the configuration from the first file that exists, falling back
    /// to built-in defaults when none does.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        for path in DEFAULT_PATHS {
            let path = Path::new(path);
            if path.exists() {
                return Self::from_file(path);
            }
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let config = RuntimeConfig::default();
        assert_eq!(config.hypervisor.default_vcpus, 1);
        assert_eq!(config.agent.dial_timeout_secs, 30);
    }

    #[test]
    fn parses_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[hypervisor]\npath = \"/usr/bin/cloud-hypervisor\"\ndefault_vcpus = 4\n"
        )
        .unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.hypervisor.path,
            PathBuf::from("/usr/bin/cloud-hypervisor")
        );
        assert_eq!(config.hypervisor.default_vcpus, 4);
        // untouched sections keep their defaults
        assert_eq!(config.hypervisor.default_memory_mb, 2048);
    }

    #[test]
    fn rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hypervisor = 3").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(file.path()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
