use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap as Map, fmt, path::PathBuf};

use crate::{launch::LaunchConfig, manifest::RequiredPackages};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The OS and language runtime every build step runs on top of.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseImage(pub String);

impl Default for BaseImage {
    fn default() -> Self {
        BaseImage("python:3.9-slim".into())
    }
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

/// Everything the backend needs to build one image. `dockerfile` names the
/// rendered recipe inside the context archive.
#[derive(Clone, Debug)]
pub struct ImageBuildSpec {
    pub name: ImageName,
    pub context_archive: PathBuf,
    pub dockerfile: String,
    pub labels: Map<String, String>,
    pub pull: bool,
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

#[derive(Clone, Debug)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Configured,
    Running,
    Exited,
    Unknown,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

#[derive(Clone, Debug, Hash)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image_name: ImageName,
    pub ports: Vec<PortMapping>,
    pub env: Map<String, String>,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CopySpec {
    pub from: String,
    pub to: String,
}

/// A fully resolved build-and-launch recipe for one dashboard project.
#[derive(Clone, Debug)]
pub struct Recipe {
    pub project_name: String,
    pub context: PathBuf,
    pub image_name: ImageName,
    pub base_image: BaseImage,
    pub workdir: String,
    pub os_packages: Vec<String>,
    pub manifest: String,
    pub required_packages: RequiredPackages,
    pub source: CopySpec,
    pub config_dir: Option<CopySpec>,
    pub port: u16,
    pub environment: Map<String, String>,
    pub launch: LaunchConfig,
}

impl Recipe {
    pub fn container_name(&self) -> ContainerName {
        ContainerName(format!("{}_dashboard", self.project_name))
    }
}
