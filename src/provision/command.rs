use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::broker::Resource;
use crate::config::ProvisionerConfig;
use crate::error::{BuildfarmError, Result};
use crate::provision::ProvisioningBackend;

/// Provisions builders by running external commands.
///
/// Each command is run through `sh -c`. Create prints one JSON resource and
/// list prints a JSON array of them; destroy receives the id as its final
/// argument. A non-zero exit is a failure carrying the command's stderr.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    config: ProvisionerConfig,
}

impl CommandProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command_line: &str) -> Result<String> {
        tracing::debug!(command = command_line, "Running provisioning command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                BuildfarmError::Provisioning(format!("failed to run '{}': {}", command_line, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildfarmError::Provisioning(format!(
                "'{}' exited with {:?}: {}",
                command_line,
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_output<T: serde::de::DeserializeOwned>(command: &str, stdout: &str) -> Result<T> {
    serde_json::from_str(stdout.trim()).map_err(|e| {
        BuildfarmError::Provisioning(format!("unexpected output from '{}': {}", command, e))
    })
}

#[async_trait]
impl ProvisioningBackend for CommandProvisioner {
    async fn list_active(&self) -> Result<Vec<Resource>> {
        let stdout = self.run(&self.config.list_command).await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_output(&self.config.list_command, &stdout)
    }

    async fn create_one(&self) -> Result<Resource> {
        let stdout = self.run(&self.config.create_command).await?;
        parse_output(&self.config.create_command, &stdout)
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let command_line = format!("{} '{}'", self.config.destroy_command, id.replace('\'', ""));
        self.run(&command_line).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner(create: &str, destroy: &str, list: &str) -> CommandProvisioner {
        CommandProvisioner::new(ProvisionerConfig {
            create_command: create.to_string(),
            destroy_command: destroy.to_string(),
            list_command: list.to_string(),
        })
    }

    #[tokio::test]
    async fn create_parses_resource_json() {
        let p = provisioner(
            r#"echo '{"id":"vm-1","host":"10.0.0.5","port":"8080"}'"#,
            "true",
            "echo '[]'",
        );
        let resource = p.create_one().await.unwrap();
        assert_eq!(resource.id, "vm-1");
        assert_eq!(resource.address(), "10.0.0.5:8080");
    }

    #[tokio::test]
    async fn list_parses_array_and_tolerates_empty_output() {
        let p = provisioner(
            "false",
            "true",
            r#"echo '[{"id":"a","host":"h","port":"1"},{"id":"b","host":"h","port":"2"}]'"#,
        );
        let live = p.list_active().await.unwrap();
        assert_eq!(live.len(), 2);

        let p = provisioner("false", "true", "true");
        assert!(p.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let p = provisioner("echo 'quota exceeded' >&2; exit 3", "true", "true");
        let err = p.create_one().await.unwrap_err();
        match err {
            BuildfarmError::Provisioning(msg) => assert!(msg.contains("quota exceeded")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn destroy_passes_id_as_argument() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("destroyed");
        let p = provisioner(
            "false",
            &format!("sh -c 'echo \"$0\" > {}'", marker.display()),
            "true",
        );
        p.destroy("vm-9").await.unwrap();
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "vm-9");
    }

    #[tokio::test]
    async fn garbage_output_is_a_provisioning_error() {
        let p = provisioner("echo not-json", "true", "true");
        assert!(matches!(
            p.create_one().await,
            Err(BuildfarmError::Provisioning(_))
        ));
    }
}
