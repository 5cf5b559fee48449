use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path};

use crate::models::{
    Container, ContainerId, ContainerName, ContainerSpec, Image, ImageBuildSpec, ImageId,
    ImageName, Recipe,
};

pub trait RecipeFrontend {
    fn recipe<P: AsRef<Path>>(&mut self, project_name: &str, recipe_file_path: P) -> Result<Recipe>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(ImageId),
    Failed { status: i32 },
}

pub trait ContainerBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>>;

    /// Builds an image, handing every line of build output to `output` as it
    /// arrives. A build that runs but exits non-zero is an `Ok` outcome.
    fn build_image(
        &mut self,
        spec: ImageBuildSpec,
        output: &mut dyn FnMut(&str),
    ) -> Result<BuildOutcome>;

    /// Asks the image's package installer about each package and returns the
    /// ones it doesn't know.
    fn missing_packages(&mut self, image: &ImageName, packages: &[&str]) -> Result<Vec<String>>;

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>>;

    fn create_container(&mut self, container_spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, name: &str) -> Result<ContainerId>;

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId>;

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId>;
}
