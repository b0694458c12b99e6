use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::DeploymentSettings;
use crate::platform::volume::VolumeLayout;

#[derive(Deserialize, Debug, Clone)]
pub struct RotorConfig {
    pub database_url: String,
    pub encryption_secret: String,
    pub platform_cli: Vec<String>,
    pub volume_name: String,
    pub app_name: String,
    pub min_credit_threshold: f64,
    pub default_gpu: String,
    pub phase1_file: PathBuf,
    pub phase2_file: PathBuf,
    pub run_file: PathBuf,
    pub phase1_timeout_secs: u64,
    pub phase2_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub readiness_url: String,
    pub readiness_max_wait_secs: u64,
    pub readiness_interval_secs: u64,
    pub startup_grace_secs: u64,
    pub balance_file: String,
    pub workflows_path: String,
    pub outputs_path: String,
    pub download_dir: PathBuf,
    pub log_dir: String,
    pub watch_interval_secs: u64,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialRotorConfig {
    database_url: Option<String>,
    encryption_secret: Option<String>,
    platform_cli: Option<Vec<String>>,
    volume_name: Option<String>,
    app_name: Option<String>,
    min_credit_threshold: Option<f64>,
    default_gpu: Option<String>,
    phase1_file: Option<PathBuf>,
    phase2_file: Option<PathBuf>,
    run_file: Option<PathBuf>,
    phase1_timeout_secs: Option<u64>,
    phase2_timeout_secs: Option<u64>,
    run_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    readiness_url: Option<String>,
    readiness_max_wait_secs: Option<u64>,
    readiness_interval_secs: Option<u64>,
    startup_grace_secs: Option<u64>,
    balance_file: Option<String>,
    workflows_path: Option<String>,
    outputs_path: Option<String>,
    download_dir: Option<PathBuf>,
    log_dir: Option<String>,
    watch_interval_secs: Option<u64>,
}

fn default_database_url() -> String {
    "sqlite://rotor.db?mode=rwc".to_string()
}

fn default_platform_cli() -> Vec<String> {
    vec!["modal".to_string()]
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl RotorConfig {
    /// File first, then `ROTOR_*` environment variables on top, then defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config = match config_path {
            Some(path_str) => read_file(Path::new(path_str))?,
            None => PartialRotorConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialRotorConfig = envy::prefixed("ROTOR_")
            .from_env::<PartialRotorConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialRotorConfig, file: PartialRotorConfig) -> Result<Self, String> {
        let config = RotorConfig {
            database_url: env
                .database_url
                .or(file.database_url)
                .unwrap_or_else(default_database_url),
            encryption_secret: env
                .encryption_secret
                .or(file.encryption_secret)
                .ok_or("ROTOR_ENCRYPTION_SECRET is required")?,
            platform_cli: env
                .platform_cli
                .or(file.platform_cli)
                .unwrap_or_else(default_platform_cli),
            volume_name: env
                .volume_name
                .or(file.volume_name)
                .unwrap_or_else(|| "workspace".to_string()),
            app_name: env
                .app_name
                .or(file.app_name)
                .unwrap_or_else(|| "comfyui".to_string()),
            min_credit_threshold: env
                .min_credit_threshold
                .or(file.min_credit_threshold)
                .unwrap_or(1.0),
            default_gpu: env
                .default_gpu
                .or(file.default_gpu)
                .unwrap_or_else(|| "H100".to_string()),
            phase1_file: env
                .phase1_file
                .or(file.phase1_file)
                .unwrap_or_else(|| PathBuf::from("deploy/phase1.py")),
            phase2_file: env
                .phase2_file
                .or(file.phase2_file)
                .unwrap_or_else(|| PathBuf::from("deploy/phase2.py")),
            run_file: env
                .run_file
                .or(file.run_file)
                .unwrap_or_else(|| PathBuf::from("deploy/run.py")),
            phase1_timeout_secs: env
                .phase1_timeout_secs
                .or(file.phase1_timeout_secs)
                .unwrap_or(10_800),
            phase2_timeout_secs: env
                .phase2_timeout_secs
                .or(file.phase2_timeout_secs)
                .unwrap_or(3_600),
            run_timeout_secs: env
                .run_timeout_secs
                .or(file.run_timeout_secs)
                .unwrap_or(86_400),
            command_timeout_secs: env
                .command_timeout_secs
                .or(file.command_timeout_secs)
                .unwrap_or(120),
            readiness_url: env
                .readiness_url
                .or(file.readiness_url)
                .ok_or("ROTOR_READINESS_URL is required")?,
            readiness_max_wait_secs: env
                .readiness_max_wait_secs
                .or(file.readiness_max_wait_secs)
                .unwrap_or(300),
            readiness_interval_secs: env
                .readiness_interval_secs
                .or(file.readiness_interval_secs)
                .unwrap_or(5),
            startup_grace_secs: env
                .startup_grace_secs
                .or(file.startup_grace_secs)
                .unwrap_or(10),
            balance_file: env
                .balance_file
                .or(file.balance_file)
                .unwrap_or_else(|| "balance.json".to_string()),
            workflows_path: env
                .workflows_path
                .or(file.workflows_path)
                .unwrap_or_else(|| "ComfyUI/user/default/workflows".to_string()),
            outputs_path: env
                .outputs_path
                .or(file.outputs_path)
                .unwrap_or_else(|| "ComfyUI/output".to_string()),
            download_dir: env
                .download_dir
                .or(file.download_dir)
                .unwrap_or_else(|| PathBuf::from("downloads")),
            log_dir: env
                .log_dir
                .or(file.log_dir)
                .unwrap_or_else(default_log_dir),
            watch_interval_secs: env
                .watch_interval_secs
                .or(file.watch_interval_secs)
                .unwrap_or(300),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.platform_cli.is_empty() {
            return Err("platform_cli must name a program".to_string());
        }
        if !self.min_credit_threshold.is_finite() || self.min_credit_threshold < 0.0 {
            return Err(format!(
                "min_credit_threshold must be a non-negative number, got {}",
                self.min_credit_threshold
            ));
        }
        if self.readiness_interval_secs == 0 {
            return Err("readiness_interval_secs must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn deployment_settings(&self) -> DeploymentSettings {
        DeploymentSettings {
            app_name: self.app_name.clone(),
            default_gpu: self.default_gpu.clone(),
            phase1_file: self.phase1_file.clone(),
            phase2_file: self.phase2_file.clone(),
            run_file: self.run_file.clone(),
            phase1_timeout: Duration::from_secs(self.phase1_timeout_secs),
            phase2_timeout: Duration::from_secs(self.phase2_timeout_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            command_timeout: self.command_timeout(),
            readiness_max_wait: Duration::from_secs(self.readiness_max_wait_secs),
            readiness_interval: Duration::from_secs(self.readiness_interval_secs),
            startup_grace: Duration::from_secs(self.startup_grace_secs),
        }
    }

    pub fn volume_layout(&self) -> VolumeLayout {
        VolumeLayout {
            volume: self.volume_name.clone(),
            workflows_path: self.workflows_path.clone(),
            outputs_path: self.outputs_path.clone(),
            download_dir: self.download_dir.clone(),
        }
    }
}

fn read_file(path: &Path) -> Result<PartialRotorConfig, String> {
    if !path.exists() {
        return Ok(PartialRotorConfig::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
    toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn required() -> PartialRotorConfig {
        PartialRotorConfig {
            encryption_secret: Some("secret".to_string()),
            readiness_url: Some("https://example.invalid".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = RotorConfig::merge(required(), PartialRotorConfig::default()).unwrap();

        assert_eq!(config.database_url, "sqlite://rotor.db?mode=rwc");
        assert_eq!(config.platform_cli, vec!["modal"]);
        assert_eq!(config.min_credit_threshold, 1.0);
        assert_eq!(config.default_gpu, "H100");

        let settings = config.deployment_settings();
        assert_eq!(settings.phase1_timeout, Duration::from_secs(10_800));
        assert_eq!(settings.phase2_timeout, Duration::from_secs(3_600));
        assert_eq!(settings.run_timeout, Duration::from_secs(86_400));
        assert_eq!(settings.readiness_max_wait, Duration::from_secs(300));
        assert_eq!(settings.startup_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
            encryption_secret = "from-file"
            readiness_url = "https://file.example"
            default_gpu = "A10G"
            min_credit_threshold = 2.5
            platform_cli = ["python", "-m", "modal"]
            "#,
        );
        let file_config = read_file(file.path()).unwrap();
        let env_config = PartialRotorConfig {
            default_gpu: Some("L4".to_string()),
            ..Default::default()
        };

        let config = RotorConfig::merge(env_config, file_config).unwrap();

        assert_eq!(config.encryption_secret, "from-file");
        assert_eq!(config.default_gpu, "L4");
        assert_eq!(config.min_credit_threshold, 2.5);
        assert_eq!(config.platform_cli, vec!["python", "-m", "modal"]);
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let env_config = PartialRotorConfig {
            readiness_url: Some("https://example.invalid".to_string()),
            ..Default::default()
        };
        let err = RotorConfig::merge(env_config, PartialRotorConfig::default()).unwrap_err();
        assert!(err.contains("ENCRYPTION_SECRET"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let env_config = PartialRotorConfig {
            min_credit_threshold: Some(-1.0),
            ..required()
        };
        assert!(RotorConfig::merge(env_config, PartialRotorConfig::default()).is_err());

        let env_config = PartialRotorConfig {
            platform_cli: Some(Vec::new()),
            ..required()
        };
        assert!(RotorConfig::merge(env_config, PartialRotorConfig::default()).is_err());
    }

    #[test]
    fn test_missing_file_and_bad_toml() {
        assert!(read_file(Path::new("/nonexistent/rotor.toml")).is_ok());

        let file = write_config("default_gpu = [");
        assert!(read_file(file.path()).is_err());
    }
}
