use crate::error::ConfigError;
use crate::transport::{EndpointKind, HOST_MAX_CHUNK, VCENTER_MAX_CHUNK};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrateConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_nbdkit_path")]
    pub nbdkit_path: PathBuf,
    #[serde(default = "default_plugin")]
    pub plugin: String,
    #[serde(default = "default_vddk_libdir")]
    pub vddk_libdir: PathBuf,
    /// VDDK transport modes in preference order, e.g. `"nbdssl:nbd"`.
    #[serde(default)]
    pub transports: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    #[serde(default = "default_nbdcopy_path")]
    pub nbdcopy_path: PathBuf,
    #[serde(default = "default_host_chunk_size")]
    pub host_chunk_size: String,
    #[serde(default = "default_vcenter_chunk_size")]
    pub vcenter_chunk_size: String,
    #[serde(default = "default_zero_chunk_size")]
    pub zero_chunk_size: String,
    /// Extents shorter than this are copied without a status query.
    #[serde(default = "default_min_status_extent")]
    pub min_status_extent: String,
    #[serde(default = "default_max_status_request")]
    pub max_status_request: String,
    #[serde(default = "default_progress_queue_depth")]
    pub progress_queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceExhaustion {
    /// Move on to conversion with whatever delta remains.
    Proceed,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_login_retry_limit")]
    pub login_retry_limit: u32,
    #[serde(default = "default_copy_retry_limit")]
    pub copy_retry_limit: u32,
    #[serde(default = "default_conversion_retry_limit")]
    pub conversion_retry_limit: u32,
    #[serde(default = "default_cutover_retry_limit")]
    pub cutover_retry_limit: u32,
    #[serde(default = "default_max_migration_attempts")]
    pub max_migration_attempts: u32,
    #[serde(default = "default_max_change_iterations")]
    pub max_change_iterations: u32,
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: String,
    #[serde(default = "default_on_convergence_exhausted")]
    pub on_convergence_exhausted: ConvergenceExhaustion,
    #[serde(default = "default_true")]
    pub final_sync_after_power_off: bool,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Byte sizes from [`CopyConfig`], parsed and checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyLimits {
    pub host_chunk: u64,
    pub vcenter_chunk: u64,
    pub zero_chunk: u64,
    pub min_status_extent: u64,
    pub max_status_request: u64,
}

impl CopyLimits {
    pub fn chunk_for(&self, kind: EndpointKind) -> u64 {
        match kind {
            EndpointKind::Host => self.host_chunk,
            EndpointKind::VCenter => self.vcenter_chunk,
        }
    }
}

impl Default for CopyLimits {
    fn default() -> Self {
        Self {
            host_chunk: HOST_MAX_CHUNK,
            vcenter_chunk: VCENTER_MAX_CHUNK,
            zero_chunk: 16 * 1024 * 1024,
            min_status_extent: 1024 * 1024,
            max_status_request: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nbdkit_path: default_nbdkit_path(),
            plugin: default_plugin(),
            vddk_libdir: default_vddk_libdir(),
            transports: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
        }
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            nbdcopy_path: default_nbdcopy_path(),
            host_chunk_size: default_host_chunk_size(),
            vcenter_chunk_size: default_vcenter_chunk_size(),
            zero_chunk_size: default_zero_chunk_size(),
            min_status_extent: default_min_status_extent(),
            max_status_request: default_max_status_request(),
            progress_queue_depth: default_progress_queue_depth(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            login_retry_limit: default_login_retry_limit(),
            copy_retry_limit: default_copy_retry_limit(),
            conversion_retry_limit: default_conversion_retry_limit(),
            cutover_retry_limit: default_cutover_retry_limit(),
            max_migration_attempts: default_max_migration_attempts(),
            max_change_iterations: default_max_change_iterations(),
            convergence_threshold: default_convergence_threshold(),
            on_convergence_exhausted: default_on_convergence_exhausted(),
            final_sync_after_power_off: true,
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_nbdkit_path() -> PathBuf {
    PathBuf::from("nbdkit")
}

fn default_plugin() -> String {
    "vddk".to_string()
}

fn default_vddk_libdir() -> PathBuf {
    PathBuf::from("/opt/vmware-vix-disklib-distrib")
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_nbdcopy_path() -> PathBuf {
    PathBuf::from("nbdcopy")
}

fn default_host_chunk_size() -> String {
    "23Mi".to_string()
}

fn default_vcenter_chunk_size() -> String {
    "2Mi".to_string()
}

fn default_zero_chunk_size() -> String {
    "16Mi".to_string()
}

fn default_min_status_extent() -> String {
    "1Mi".to_string()
}

fn default_max_status_request() -> String {
    "2Gi".to_string()
}

fn default_progress_queue_depth() -> usize {
    32
}

fn default_login_retry_limit() -> u32 {
    5
}

fn default_copy_retry_limit() -> u32 {
    5
}

fn default_conversion_retry_limit() -> u32 {
    3
}

fn default_cutover_retry_limit() -> u32 {
    3
}

fn default_max_migration_attempts() -> u32 {
    3
}

fn default_max_change_iterations() -> u32 {
    20
}

fn default_convergence_threshold() -> String {
    "256Mi".to_string()
}

fn default_on_convergence_exhausted() -> ConvergenceExhaustion {
    ConvergenceExhaustion::Proceed
}

fn default_true() -> bool {
    true
}

fn default_retry_base_delay_secs() -> u64 {
    10
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl CopyConfig {
    pub fn limits(&self) -> Result<CopyLimits, ConfigError> {
        let limits = CopyLimits {
            host_chunk: parse_size(&self.host_chunk_size)?,
            vcenter_chunk: parse_size(&self.vcenter_chunk_size)?,
            zero_chunk: parse_size(&self.zero_chunk_size)?,
            min_status_extent: parse_size(&self.min_status_extent)?,
            max_status_request: parse_size(&self.max_status_request)?,
        };

        if limits.host_chunk == 0 || limits.host_chunk > HOST_MAX_CHUNK {
            return Err(ConfigError::Invalid(format!(
                "host_chunk_size must be between 1 and {} bytes",
                HOST_MAX_CHUNK
            )));
        }
        if limits.vcenter_chunk == 0 || limits.vcenter_chunk > VCENTER_MAX_CHUNK {
            return Err(ConfigError::Invalid(format!(
                "vcenter_chunk_size must be between 1 and {} bytes",
                VCENTER_MAX_CHUNK
            )));
        }
        if limits.zero_chunk == 0 {
            return Err(ConfigError::Invalid("zero_chunk_size must be non-zero".into()));
        }
        // Block status lengths travel as u32.
        if limits.max_status_request == 0 || limits.max_status_request > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(
                "max_status_request must fit in 32 bits".into(),
            ));
        }
        Ok(limits)
    }
}

impl PolicyConfig {
    pub fn convergence_threshold_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.convergence_threshold)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl MigrateConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: MigrateConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.copy.limits()?;
        self.policy.convergence_threshold_bytes()?;
        if self.policy.max_change_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_change_iterations must be at least 1".into(),
            ));
        }
        if self.policy.retry_base_delay_secs > self.policy.retry_max_delay_secs {
            return Err(ConfigError::Invalid(
                "retry_base_delay_secs exceeds retry_max_delay_secs".into(),
            ));
        }
        Ok(())
    }

    /// `$XDG_CONFIG_HOME/vmigrate/config.toml`, when a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmigrate").join("config.toml"))
    }
}

/// Parse a size like "16Mi", "2Gi", "512K" or "4096" into bytes.
pub fn parse_size(size: &str) -> Result<u64, ConfigError> {
    let size = size.trim();
    if size.is_empty() {
        return Err(ConfigError::Invalid("empty size".into()));
    }

    let split = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (number_part, suffix) = size.split_at(split);
    let number: u64 = number_part
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid size '{}'", size)))?;

    let multiplier: u64 = match suffix.trim() {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown size suffix '{}' in '{}'",
                other, size
            )));
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::Invalid(format!("size '{}' overflows", size)))
}
