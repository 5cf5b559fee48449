use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    fs::{self, File},
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    sync::mpsc,
    thread,
};
use tempfile::TempDir;

use crate::{
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, Image,
        ImageBuildSpec, ImageId, ImageName,
    },
    services::{BuildOutcome, ContainerBackend},
};

/// Drives any docker compatible command line, `podman` and `docker` alike.
pub struct CliBackend {
    runtime: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<Map<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    name: String,
    state: InspectedState,
    #[serde(default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
}

fn labels(config: Option<InspectedConfig>) -> Map<String, String> {
    config
        .and_then(|config| config.labels)
        .unwrap_or_else(Default::default)
}

fn container_status(status: &str) -> ContainerStatus {
    match status {
        "configured" | "created" => ContainerStatus::Configured,
        "running" => ContainerStatus::Running,
        "exited" | "stopped" => ContainerStatus::Exited,
        status => {
            warn!("unknown container status: {:?}", status);
            ContainerStatus::Unknown
        }
    }
}

/// Last non-empty line of a command's standard output, which is where both
/// runtimes print the id or name they acted on.
fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).filter(|line| !line.is_empty()).last()
}

impl CliBackend {
    pub fn new<P: Into<PathBuf>>(runtime: P) -> CliBackend {
        CliBackend {
            runtime: runtime.into(),
        }
    }

    /// Checks that the runtime binary can be executed at all.
    pub fn connect<P: Into<PathBuf>>(runtime: P) -> Result<CliBackend> {
        let backend = CliBackend::new(runtime);
        let version = backend.run(&["--version"])?;
        info!("using {}", version.trim());

        Ok(backend)
    }

    fn command(&self) -> Command {
        Command::new(&self.runtime)
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        debug!("running {:?} {:?}", self.runtime, args);
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("couldn't run {:?}", self.runtime))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;

        if !output.status.success() {
            bail!(
                "{:?} {} failed: {}",
                self.runtime,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8(output.stdout)?)
    }

    fn acted_on(&self, args: &[&str]) -> Result<ContainerId> {
        let stdout = self.run(args)?;
        let id = last_line(&stdout)
            .ok_or_else(|| anyhow!("{:?} {} printed nothing", self.runtime, args[0]))?;

        Ok(ContainerId(id.into()))
    }
}

/// Forwards every line from `reader` until it closes.
fn forward_lines<R: Read + Send + 'static>(reader: R, sender: mpsc::Sender<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("stopped reading build output: {}", err);
                    break;
                }
            }
        }
    })
}

impl ContainerBackend for CliBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        let output = self.output(&["image", "inspect", &name.0])?;

        if !output.status.success() {
            debug!(
                "image {} not found: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let images: Vec<InspectedImage> = serde_json::from_slice(&output.stdout)
            .context("couldn't parse image inspect output")?;

        Ok(images.into_iter().next().map(|image| Image {
            id: ImageId(image.id),
            labels: labels(image.config),
        }))
    }

    fn build_image(
        &mut self,
        spec: ImageBuildSpec,
        output: &mut dyn FnMut(&str),
    ) -> Result<BuildOutcome> {
        let temp_dir = TempDir::new()?;
        let iidfile = temp_dir.path().join("iid");
        let iidfile_arg = path_arg(&iidfile)?;

        let mut args = vec![
            "build".to_owned(),
            "--tag".to_owned(),
            spec.name.0.clone(),
            "--file".to_owned(),
            spec.dockerfile.clone(),
            "--iidfile".to_owned(),
            iidfile_arg,
        ];

        if spec.pull {
            args.push("--pull".into());
        }

        for (key, value) in spec.labels.iter() {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        // The context archive is read from stdin.
        args.push("-".into());

        let context = File::open(&spec.context_archive)
            .with_context(|| format!("couldn't open {:?}", spec.context_archive))?;

        debug!("running {:?} {:?}", self.runtime, args);
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::from(context))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("couldn't run {:?}", self.runtime))?;

        let (sender, receiver) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, sender.clone()));
        }
        drop(sender);

        for line in receiver {
            output(&line);
        }

        for reader in readers {
            reader
                .join()
                .map_err(|_| anyhow!("build output reader panicked"))?;
        }

        let status = child.wait()?;
        if !status.success() {
            // A build killed by a signal has no code.
            let status = status.code().unwrap_or(1);
            return Ok(BuildOutcome::Failed { status });
        }

        let image_id = fs::read_to_string(&iidfile)
            .with_context(|| format!("{:?} didn't write an image id", self.runtime))?;
        temp_dir.close()?;

        Ok(BuildOutcome::Built(ImageId(image_id.trim().into())))
    }

    fn missing_packages(&mut self, image: &ImageName, packages: &[&str]) -> Result<Vec<String>> {
        let mut missing = Vec::new();

        for package in packages {
            let output = self.output(&[
                "run",
                "--rm",
                "--entrypoint",
                "pip",
                &image.0,
                "show",
                "--quiet",
                package,
            ])?;

            if output.status.success() {
                debug!("{} reports {} as installed", image, package);
            } else {
                debug!(
                    "{} doesn't have {}: {}",
                    image,
                    package,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                missing.push((*package).to_owned());
            }
        }

        Ok(missing)
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let mut containers = Map::new();

        let filters = labels
            .iter()
            .map(|(label, value)| format!("label={}={}", label, value))
            .collect::<Vec<_>>();

        let mut args = vec!["ps", "--all", "--quiet", "--no-trunc"];
        for filter in filters.iter() {
            args.push("--filter");
            args.push(filter);
        }

        let ids = self.run(&args)?;
        let ids = ids
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect::<Vec<_>>();

        if ids.is_empty() {
            return Ok(containers);
        }

        let mut args = vec!["container", "inspect"];
        args.extend(ids);

        let inspected: Vec<InspectedContainer> = serde_json::from_str(&self.run(&args)?)
            .context("couldn't parse container inspect output")?;

        for container in inspected {
            let container = Container {
                id: ContainerId(container.id),
                // Docker reports names with a leading slash.
                name: ContainerName(container.name.trim_start_matches('/').into()),
                status: container_status(&container.state.status),
                labels: self::labels(container.config),
            };
            containers.insert(container.name.clone(), container);
        }

        Ok(containers)
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let mut args = vec!["create".to_owned(), "--name".to_owned(), spec.name.0];

        for (key, value) in spec.labels.iter() {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        for port in spec.ports.iter() {
            args.push("--publish".into());
            args.push(port.to_string());
        }

        for (key, value) in spec.env.iter() {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image_name.0);

        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        self.acted_on(&args)
    }

    fn start_container(&mut self, name: &str) -> Result<ContainerId> {
        self.acted_on(&["start", name])
    }

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId> {
        let timeout = timeout.to_string();
        self.acted_on(&["stop", "--time", &timeout, name])
    }

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId> {
        if remove_volumes {
            self.acted_on(&["rm", "--volumes", name])
        } else {
            self.acted_on(&["rm", name])
        }
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(String::from)
        .ok_or_else(|| anyhow!("the path {:?} is not valid utf-8", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_container_inspect() {
        let json = r#"[{
            "Id": "4f1c",
            "Name": "/weather_dashboard",
            "State": { "Status": "running", "Running": true },
            "Config": { "Labels": { "io.dashpack.project": "weather" } }
        }]"#;

        let inspected: Vec<InspectedContainer> = serde_json::from_str(json).unwrap();
        let container = &inspected[0];
        assert_eq!(container.id, "4f1c");
        assert_eq!(container_status(&container.state.status), ContainerStatus::Running);
    }

    #[test]
    fn parses_podman_image_inspect_without_labels() {
        let json = r#"[{ "Id": "sha256:abc", "Config": { "Labels": null } }]"#;

        let mut images: Vec<InspectedImage> = serde_json::from_str(json).unwrap();
        let image = images.remove(0);
        assert_eq!(image.id, "sha256:abc");
        assert!(labels(image.config).is_empty());
    }

    #[test]
    fn maps_runtime_statuses() {
        assert_eq!(container_status("created"), ContainerStatus::Configured);
        assert_eq!(container_status("configured"), ContainerStatus::Configured);
        assert_eq!(container_status("stopped"), ContainerStatus::Exited);
        assert_eq!(container_status("paused"), ContainerStatus::Unknown);
    }

    #[test]
    fn finds_last_output_line() {
        assert_eq!(last_line("warning: x\nabc123\n\n"), Some("abc123"));
        assert_eq!(last_line("\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn missing_runtime_is_an_error() {
        assert!(CliBackend::connect("/nonexistent/dashpack-runtime").is_err());
    }
}
