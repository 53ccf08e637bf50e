//! The per-server configuration sidecar, persisted as `.garcon.yaml` inside
//! the server's data directory. The sidecar is the authoritative record for
//! these fields.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PortProtocol;
use crate::{GarconError, GarconResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The persisted configuration of a managed server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// The server id (`slug(name)-<40-bit-hex>`).
    pub id: String,

    /// The display name.
    pub name: String,

    /// The template this server runs under.
    pub template_id: String,

    /// The original import location; retained for the update protocol.
    pub source_path: String,

    /// When the server was imported.
    pub created_at: DateTime<Utc>,

    /// When the server configuration or files last changed.
    pub updated_at: DateTime<Utc>,

    /// Port mappings from host to container.
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Environment variables handed to the instance.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Optional memory limit (`NNN[KMGT]`, binary multiples; bare integer is
    /// bytes).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memory_limit: Option<String>,

    /// Optional CPU quota in fractional cores.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu_limit: Option<f64>,

    /// Progress through the three-phase update protocol.
    #[serde(default)]
    pub update_stage: UpdateStage,

    /// Whether the daily maintenance routine starts this server again after
    /// its snapshot-and-stop.
    #[serde(default = "default_true")]
    pub restart_after_maintenance: bool,
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// The host port.
    pub host_port: u16,

    /// The container (or process) port.
    pub container_port: u16,

    /// The transport protocol.
    pub protocol: PortProtocol,
}

/// Progress through the three-phase update protocol, orthogonal to the main
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    /// No update in progress.
    #[default]
    None,

    /// An update was initiated; a pre-update backup exists.
    Initiated,

    /// New files are staged and the update can be applied.
    ReadyToApply,

    /// The apply copy is in flight.
    Applying,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Parses a `NNN[KMGT]` memory limit into bytes.
///
/// Suffixes are binary multiples; a bare integer is bytes.
pub fn parse_memory_limit(value: &str) -> GarconResult<i64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GarconError::validation("empty memory limit"));
    }

    let (digits, multiplier) = match value.chars().last() {
        Some(c) if c.is_ascii_digit() => (value, 1i64),
        Some('K') | Some('k') => (&value[..value.len() - 1], 1i64 << 10),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1i64 << 20),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1i64 << 30),
        Some('T') | Some('t') => (&value[..value.len() - 1], 1i64 << 40),
        _ => {
            return Err(GarconError::validation(format!(
                "invalid memory limit '{}'",
                value
            )))
        }
    };

    let amount: i64 = digits.trim().parse().map_err(|_| {
        GarconError::validation(format!("invalid memory limit '{}'", value))
    })?;

    Ok(amount * multiplier)
}

/// Converts a fractional-core CPU quota into nano-CPU units.
pub fn cpu_limit_to_nano_cpus(cores: f64) -> i64 {
    (cores * 1e9) as i64
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UpdateStage {
    /// Whether an update is in progress in any stage.
    pub fn is_active(&self) -> bool {
        !matches!(self, UpdateStage::None)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512").unwrap(), 512);
        assert_eq!(parse_memory_limit("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_memory_limit("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_memory_limit("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1T").unwrap(), 1024i64.pow(4));
        assert!(parse_memory_limit("abc").is_err());
        assert!(parse_memory_limit("G").is_err());
        assert!(parse_memory_limit("").is_err());
    }

    #[test]
    fn test_cpu_limit_to_nano_cpus() {
        assert_eq!(cpu_limit_to_nano_cpus(1.0), 1_000_000_000);
        assert_eq!(cpu_limit_to_nano_cpus(0.5), 500_000_000);
        assert_eq!(cpu_limit_to_nano_cpus(2.25), 2_250_000_000);
    }

    #[test]
    fn test_sidecar_yaml_round_trip() -> anyhow::Result<()> {
        let yaml = r#"
id: alpha-0a1b2c3d4e
name: Alpha
templateId: minecraft
sourcePath: /tmp/src
createdAt: "2026-03-14T09:26:53.589Z"
updatedAt: "2026-03-14T09:26:53.589Z"
ports:
  - hostPort: 25565
    containerPort: 25565
    protocol: tcp
environment:
  JAVA_OPTS: -Xmx4G
memoryLimit: 4G
updateStage: none
"#;

        let config: ServerConfig = serde_yaml::from_str(yaml)?;
        assert_eq!(config.id, "alpha-0a1b2c3d4e");
        assert_eq!(config.update_stage, UpdateStage::None);
        assert!(config.restart_after_maintenance);

        let encoded = serde_yaml::to_string(&config)?;
        let decoded: ServerConfig = serde_yaml::from_str(&encoded)?;
        assert_eq!(config, decoded);

        Ok(())
    }
}
