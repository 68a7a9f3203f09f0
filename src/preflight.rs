use crate::collaborators::PreflightCheck;
use crate::config::MigrateConfig;
use crate::reconcile::MigrationRecord;
use crate::{Result, log_info};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityStatus {
    pub disk: String,
    pub destination: PathBuf,
    pub required_bytes: u64,
    pub available_bytes: Option<u64>,
}

impl CapacityStatus {
    pub fn is_sufficient(&self) -> bool {
        self.available_bytes
            .is_some_and(|available| available >= self.required_bytes)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub tool_status: Vec<ToolStatus>,
    pub vddk_libdir: Option<(PathBuf, bool)>,
    pub capacity: Vec<CapacityStatus>,
    pub issues: Vec<String>,
}

impl PreflightReport {
    pub fn is_ready(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vmigrate preflight summary")?;
        writeln!(f, "\nTooling:")?;
        for tool in &self.tool_status {
            writeln!(
                f,
                "  - {}: {}",
                tool.name,
                if tool.available {
                    "available"
                } else {
                    "missing"
                }
            )?;
        }
        if let Some((libdir, present)) = &self.vddk_libdir {
            writeln!(
                f,
                "  - VDDK libdir {}: {}",
                libdir.display(),
                if *present { "present" } else { "missing" }
            )?;
        }
        if !self.capacity.is_empty() {
            writeln!(f, "\nDestinations:")?;
            for status in &self.capacity {
                writeln!(
                    f,
                    "  - {} -> {}: needs {} bytes, has {}",
                    status.disk,
                    status.destination.display(),
                    status.required_bytes,
                    status
                        .available_bytes
                        .map(|bytes| format!("{} bytes", bytes))
                        .unwrap_or_else(|| "unknown".to_string())
                )?;
            }
        }
        if self.issues.is_empty() {
            writeln!(f, "\nReady to migrate")
        } else {
            writeln!(f, "\nIssues:")?;
            for issue in &self.issues {
                writeln!(f, "  - {}", issue)?;
            }
            Ok(())
        }
    }
}

/// Checks the local host: transport and copy programs, the VDDK library
/// directory and, for a given migration, destination capacity.
pub struct LocalToolPreflight {
    tools: Vec<PathBuf>,
    vddk_libdir: PathBuf,
}

impl LocalToolPreflight {
    pub fn new(config: &MigrateConfig) -> Self {
        Self {
            tools: vec![
                config.transport.nbdkit_path.clone(),
                config.copy.nbdcopy_path.clone(),
            ],
            vddk_libdir: config.transport.vddk_libdir.clone(),
        }
    }

    pub fn run(&self) -> PreflightReport {
        log_info!("Running host preflight checks");

        let tool_status: Vec<ToolStatus> = self.tools.iter().map(|tool| probe_tool(tool)).collect();
        let libdir_present = self.vddk_libdir.is_dir();

        let mut issues = Vec::new();
        for tool in &tool_status {
            if !tool.available {
                issues.push(format!("{} command missing from PATH", tool.name));
            }
        }
        if !libdir_present {
            issues.push(format!(
                "VDDK library directory {} not found",
                self.vddk_libdir.display()
            ));
        }

        PreflightReport {
            tool_status,
            vddk_libdir: Some((self.vddk_libdir.clone(), libdir_present)),
            capacity: Vec::new(),
            issues,
        }
    }
}

#[async_trait]
impl PreflightCheck for LocalToolPreflight {
    async fn check(&self, record: &MigrationRecord) -> Result<PreflightReport> {
        let mut report = self.run();
        if record.disks.is_empty() {
            report.issues.push("migration has no disks".to_string());
        }
        for disk in &record.disks {
            let status = CapacityStatus {
                disk: disk.key.clone(),
                destination: disk.destination.clone(),
                required_bytes: disk.capacity_bytes,
                available_bytes: destination_size(&disk.destination),
            };
            if !status.is_sufficient() {
                report.issues.push(format!(
                    "destination {} is smaller than disk {} ({} bytes)",
                    disk.destination.display(),
                    disk.key,
                    disk.capacity_bytes
                ));
            }
            report.capacity.push(status);
        }
        Ok(report)
    }
}

/// Size of a file or block device; `metadata().len()` is zero for the latter.
pub fn destination_size(path: &Path) -> Option<u64> {
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::End(0)).ok()
}

fn probe_tool(tool: &Path) -> ToolStatus {
    let name = tool.display().to_string();
    let available = if tool.components().count() > 1 {
        tool.is_file()
    } else {
        Command::new("sh")
            .arg("-c")
            .arg(format!("command -v {} >/dev/null 2>&1", name))
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    };

    ToolStatus { name, available }
}
