//! Template documents: immutable descriptions of how to run a class of
//! servers.

use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{GarconError, GarconResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default graceful-stop timeout in seconds.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a template's servers are executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run inside a container managed by the container daemon.
    Container,

    /// Run as a native OS process.
    Native,
}

/// Transport protocol for a published port.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP.
    Tcp,

    /// UDP.
    Udp,
}

/// An immutable description of how to run a class of servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct Template {
    /// The template identifier (slug).
    pub(crate) id: String,

    /// The display name.
    pub(crate) name: String,

    /// An optional description shown to the operator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) description: Option<String>,

    /// The execution mode.
    pub(crate) mode: ExecutionMode,

    /// Container-specific configuration. Required when `mode` is container.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) container: Option<ContainerConfig>,

    /// Execution configuration shared by both modes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) exec: Option<ExecConfig>,

    /// Default ports offered to imported servers.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub(crate) ports: Vec<PortSpec>,

    /// Filenames whose presence under the import source is a precondition.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub(crate) required_files: Vec<String>,
}

/// Container-mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct ContainerConfig {
    /// The base image reference.
    pub(crate) image: String,

    /// Where the server data directory is mounted inside the container.
    pub(crate) mount_path: String,

    /// Optional working directory inside the container.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) workdir: Option<String>,

    /// Additional bind mounts.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub(crate) mounts: Vec<MountSpec>,

    /// Default environment variables, overridable per server at import.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    #[builder(default)]
    pub(crate) environment: HashMap<String, String>,
}

/// An additional bind mount for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct MountSpec {
    /// Path on the host.
    pub(crate) host_path: String,

    /// Path inside the container.
    pub(crate) container_path: String,

    /// Whether the mount is read-only.
    #[serde(default)]
    #[builder(default)]
    pub(crate) read_only: bool,
}

/// Execution configuration shared by both modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct ExecConfig {
    /// Executable filename, resolved against the server data directory.
    /// Required for native mode.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) executable: Option<String>,

    /// Shell command template with `{VAR}` placeholders substituted from the
    /// server's environment map.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) command: Option<String>,

    /// Argument list for the executable (native mode only).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub(crate) args: Vec<String>,

    /// Optional command issued to request a graceful stop.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) stop_command: Option<String>,

    /// Graceful-stop timeout in seconds before force action is taken.
    #[serde(default = "ExecConfig::default_stop_timeout")]
    #[builder(default = DEFAULT_STOP_TIMEOUT_SECS)]
    pub(crate) stop_timeout_secs: u64,

    /// Optional RCON configuration for graceful shutdown.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) rcon: Option<RconConfig>,
}

/// RCON configuration for a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct RconConfig {
    /// Whether RCON-based shutdown is attempted.
    pub(crate) enabled: bool,

    /// The RCON port.
    pub(crate) port: u16,

    /// The RCON password.
    #[serde(default)]
    #[builder(default)]
    pub(crate) password: String,

    /// The command that requests a server shutdown.
    pub(crate) shutdown_command: String,

    /// Optional file inside the server data directory that overrides port and
    /// password at stop time (pre-stop credential override hook).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) settings_file: Option<String>,
}

/// A default port offered by a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct PortSpec {
    /// The port inside the container (or bound by the native process).
    pub(crate) container_port: u16,

    /// The transport protocol.
    pub(crate) protocol: PortProtocol,

    /// Optional operator-facing description.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub(crate) description: Option<String>,

    /// Whether players connect to this port.
    #[serde(default)]
    #[builder(default)]
    pub(crate) user_facing: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Template {
    /// Validates the template document.
    ///
    /// Container mode requires a container block; native mode requires an
    /// executable; an enabled RCON block requires a password.
    pub fn validate(&self) -> GarconResult<()> {
        match self.mode {
            ExecutionMode::Container => {
                if self.container.is_none() {
                    return Err(GarconError::validation(format!(
                        "template '{}' uses container mode without a container block",
                        self.id
                    )));
                }
            }
            ExecutionMode::Native => {
                let has_executable = self
                    .exec
                    .as_ref()
                    .and_then(|e| e.executable.as_ref())
                    .is_some();
                if !has_executable {
                    return Err(GarconError::validation(format!(
                        "template '{}' uses native mode without an executable",
                        self.id
                    )));
                }
            }
        }

        if let Some(rcon) = self.exec.as_ref().and_then(|e| e.rcon.as_ref()) {
            if rcon.enabled && rcon.password.is_empty() && rcon.settings_file.is_none() {
                return Err(GarconError::validation(format!(
                    "template '{}' enables rcon without a password or settings file",
                    self.id
                )));
            }
        }

        Ok(())
    }

    /// The graceful-stop timeout for this template.
    pub fn stop_timeout_secs(&self) -> u64 {
        self.exec
            .as_ref()
            .map(|e| e.stop_timeout_secs)
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SECS)
    }
}

impl ExecConfig {
    fn default_stop_timeout() -> u64 {
        DEFAULT_STOP_TIMEOUT_SECS
    }
}

impl PortProtocol {
    /// The lowercase wire form, e.g. for `"<port>/<proto>"` port keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn container_template() -> Template {
        Template::builder()
            .id("minecraft".to_string())
            .name("Minecraft".to_string())
            .mode(ExecutionMode::Container)
            .container(
                ContainerConfig::builder()
                    .image("eclipse-temurin:21-jre".to_string())
                    .mount_path("/data".to_string())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_container_mode_requires_container_block() {
        let mut template = container_template();
        assert!(template.validate().is_ok());

        template.container = None;
        assert!(matches!(
            template.validate(),
            Err(GarconError::Validation(_))
        ));
    }

    #[test]
    fn test_native_mode_requires_executable() {
        let template = Template::builder()
            .id("vrising".to_string())
            .name("V Rising".to_string())
            .mode(ExecutionMode::Native)
            .exec(ExecConfig::builder().build())
            .build();

        assert!(matches!(
            template.validate(),
            Err(GarconError::Validation(_))
        ));
    }

    #[test]
    fn test_stop_timeout_defaults() {
        let template = container_template();
        assert_eq!(template.stop_timeout_secs(), DEFAULT_STOP_TIMEOUT_SECS);
    }

    #[test]
    fn test_template_yaml_round_trip() -> anyhow::Result<()> {
        let yaml = r#"
id: minecraft
name: Minecraft
mode: container
container:
  image: eclipse-temurin:21-jre
  mountPath: /data
  environment:
    JAVA_OPTS: -Xmx2G
exec:
  command: "java {JAVA_OPTS} -jar server.jar nogui"
  stopTimeoutSecs: 30
  rcon:
    enabled: true
    port: 25575
    password: garcon
    shutdownCommand: stop
ports:
  - containerPort: 25565
    protocol: tcp
    userFacing: true
requiredFiles:
  - server.jar
"#;

        let template: Template = serde_yaml::from_str(yaml)?;
        template.validate()?;
        assert_eq!(template.id, "minecraft");
        assert_eq!(template.ports[0].container_port, 25565);
        assert_eq!(template.stop_timeout_secs(), 30);

        Ok(())
    }
}
