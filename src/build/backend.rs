use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::build::process::BuildProcess;
use crate::error::{BuildfarmError, Result};
use crate::protocol::Architecture;

/// Which tool turns a recipe into an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// `singularity build <image> <recipe>`.
    Singularity,
    /// `singularity build` inside the `singularity_builder` docker image,
    /// with the work directory bind mounted.
    Docker,
    /// Operator supplied shell template. `{recipe}`, `{image}` and `{arch}`
    /// are substituted before running it with `sh -c`.
    Command(String),
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "singularity" => Ok(BackendKind::Singularity),
            "docker" => Ok(BackendKind::Docker),
            other => match other.strip_prefix("command:") {
                Some(template) if !template.trim().is_empty() => {
                    Ok(BackendKind::Command(template.to_string()))
                }
                _ => Err(format!(
                    "unknown backend '{}', expected singularity, docker or command:<template>",
                    other
                )),
            },
        }
    }
}

/// Everything a backend needs for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub recipe: PathBuf,
    /// Where the image must appear on success.
    pub image: PathBuf,
    pub work_dir: PathBuf,
    pub arch: Architecture,
    pub tty: bool,
}

#[derive(Debug, Clone)]
pub struct BuildBackend {
    kind: BackendKind,
}

impl BuildBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    /// Shell command line for `request`.
    pub fn command_line(&self, request: &BuildRequest) -> String {
        let recipe = quote(&request.recipe.display().to_string());
        let image = quote(&request.image.display().to_string());

        match &self.kind {
            BackendKind::Singularity => {
                // unbuffer gives the build a pty so progress output renders
                // as it would on the client's terminal.
                let prefix = if request.tty { "unbuffer " } else { "" };
                format!("{}singularity build {} {}", prefix, image, recipe)
            }
            BackendKind::Docker => {
                let platform = match request.arch {
                    Architecture::X86_64 => "linux/amd64",
                    Architecture::Ppc64le => "linux/ppc64le",
                };
                format!(
                    "docker run --rm --privileged --platform={} \
                     --mount type=bind,source={},destination=/work_dir -w /work_dir \
                     singularity_builder build {} {}",
                    platform,
                    quote(&request.work_dir.display().to_string()),
                    quote(&container_path(&request.image, &request.work_dir)),
                    quote(&container_path(&request.recipe, &request.work_dir)),
                )
            }
            BackendKind::Command(template) => template
                .replace("{recipe}", &recipe)
                .replace("{image}", &image)
                .replace("{arch}", &request.arch.to_string()),
        }
    }

    /// Start the build. Stdout and stderr are merged into one stream.
    pub fn launch(&self, request: &BuildRequest) -> Result<BuildProcess> {
        let command_line = self.command_line(request);
        tracing::info!(command = %command_line, arch = %request.arch, "Launching build");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec 2>&1; {}", command_line))
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildfarmError::Build(format!("failed to launch build: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuildfarmError::Build("build output was not captured".to_string()))?;
        Ok(BuildProcess::new(child, stdout))
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Path of `path` as seen from inside the container's `/work_dir`.
fn container_path(path: &std::path::Path, work_dir: &std::path::Path) -> String {
    match path.strip_prefix(work_dir) {
        Ok(relative) => format!("/work_dir/{}", relative.display()),
        Err(_) => path.display().to_string(),
    }
}
