// Offload Configuration
// Container image, bucket names, polling cadence and cache layout

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the offloader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OffloadConfig {
    /// Container image repository
    pub image_repository: String,
    /// Container image tag
    pub image_tag: String,
    /// Compute binary inside the container
    pub compute_entrypoint: String,
    /// Directory where input buckets are mounted in the job
    pub mount_root: String,
    /// Provider profile for graphs with accelerated stages
    pub accelerated_profile: String,
    /// Provider profile for CPU-only graphs
    pub standard_profile: String,
    /// Bucket receiving the graph and its input files
    pub input_bucket: String,
    /// Bucket receiving job results
    pub output_bucket: String,
    /// Delay between two status polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Where sanitized graph copies are written
    pub temp_dir: PathBuf,
    /// Local cache directory name, created next to the graph file
    pub cache_dir_name: String,
    /// Cache root inside the output bucket
    pub remote_cache_root: String,
    /// Files the provider snapshots into the output bucket while running
    pub snapshot_whitelist: String,
    /// Node types that require an accelerated resource
    pub accelerated_node_types: Vec<String>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            image_repository: "alicevision/meshroom".to_string(),
            image_tag: "2025.1.0-av3.3.0-ubuntu22.04-cuda12.1.1".to_string(),
            compute_entrypoint: "/opt/Meshroom_bundle/meshroom_compute".to_string(),
            mount_root: "/job".to_string(),
            accelerated_profile: "docker-nvidia-batch".to_string(),
            standard_profile: "docker-batch".to_string(),
            input_bucket: "meshroomIn".to_string(),
            output_bucket: "meshroomOut".to_string(),
            poll_interval_ms: 5_000,
            temp_dir: std::env::temp_dir().join("offload"),
            cache_dir_name: "MeshroomCache".to_string(),
            remote_cache_root: "MeshroomCache".to_string(),
            snapshot_whitelist: r"^(.*status.*|.*\.mg)".to_string(),
            accelerated_node_types: vec!["DepthMap".to_string(), "DepthMapFilter".to_string()],
        }
    }
}

impl OffloadConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text; missing keys keep their defaults
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<config dir>/offload/config.yaml` when it exists, defaults otherwise
    pub fn discover() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("offload").join("config.yaml"))
    }

    /// Check the configuration for values the orchestrator cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("image_repository", &self.image_repository),
            ("compute_entrypoint", &self.compute_entrypoint),
            ("accelerated_profile", &self.accelerated_profile),
            ("standard_profile", &self.standard_profile),
            ("input_bucket", &self.input_bucket),
            ("output_bucket", &self.output_bucket),
            ("cache_dir_name", &self.cache_dir_name),
            ("remote_cache_root", &self.remote_cache_root),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("'{}' must not be empty", field)));
            }
        }

        if self.input_bucket == self.output_bucket {
            return Err(ConfigError::Invalid(
                "input and output buckets must differ".to_string(),
            ));
        }

        if !self.mount_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "mount_root '{}' must be an absolute container path",
                self.mount_root
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay between two status polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Full image reference (`repository:tag`)
    pub fn image(&self) -> String {
        if self.image_tag.is_empty() {
            self.image_repository.clone()
        } else {
            format!("{}:{}", self.image_repository, self.image_tag)
        }
    }

    /// Provider profile for a graph, by whether it has accelerated stages
    pub fn profile_for(&self, accelerated: bool) -> &str {
        if accelerated {
            &self.accelerated_profile
        } else {
            &self.standard_profile
        }
    }

    /// Whether a node type is configured as accelerated
    pub fn is_accelerated_type(&self, node_type: &str) -> bool {
        self.accelerated_node_types.iter().any(|t| t == node_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OffloadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(
            config.image(),
            "alicevision/meshroom:2025.1.0-av3.3.0-ubuntu22.04-cuda12.1.1"
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = OffloadConfig::from_yaml(
            "output_bucket: results\npoll_interval_ms: 7000\naccelerated_node_types: [Meshing]\n",
        )
        .unwrap();

        assert_eq!(config.output_bucket, "results");
        assert_eq!(config.poll_interval(), Duration::from_secs(7));
        assert_eq!(config.input_bucket, "meshroomIn");
        assert!(config.is_accelerated_type("Meshing"));
        assert!(!config.is_accelerated_type("DepthMap"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = OffloadConfig::from_yaml("poll_interval_ms: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_shared_bucket() {
        let err = OffloadConfig::from_yaml("input_bucket: data\noutput_bucket: data").unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_rejects_relative_mount_root() {
        let err = OffloadConfig::from_yaml("mount_root: job").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "standard_profile: docker-batch-large\n").unwrap();

        let config = OffloadConfig::load(&path).unwrap();
        assert_eq!(config.profile_for(false), "docker-batch-large");
        assert_eq!(config.profile_for(true), "docker-nvidia-batch");
    }

    #[test]
    fn test_load_missing_file() {
        let err = OffloadConfig::load("/nonexistent/offload.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
