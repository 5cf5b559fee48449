use anyhow::{anyhow, bail, Result};
use blake3;
use log::{info, warn};
use std::collections::BTreeMap as Map;

use crate::{
    context::{BuildContext, DOCKERFILE_NAME},
    error::BuildError,
    hasher::DigestHasher,
    launch::PORT_VARIABLE,
    manifest::Manifest,
    models::{
        BuildPolicy, Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus,
        ImageBuildSpec, ImageId, PortMapping, Recipe,
    },
    pipeline::{BuildPlan, BuildStage},
    services::{BuildOutcome, ContainerBackend},
};

const LABEL_PROJECT: &str = "io.dashpack.project";
const LABEL_HASH: &str = "io.dashpack.hash";
const LABEL_LAUNCH_MODE: &str = "io.dashpack.launch-mode";
const LABEL_IMAGE: &str = "io.dashpack.image";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerOperation {
    Create,
    Recreate,
    Start,
    Stop,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub image_id: ImageId,
    /// False when an image with the same build digest already existed.
    pub rebuilt: bool,
    pub context_size: u64,
}

/// Runtime choices made when the container is started rather than when the
/// image is built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Overrides `PORT` inside the container.
    pub port: Option<u16>,
    /// Host side of the published port, defaults to the container port.
    pub host_port: Option<u16>,
    pub env: Map<String, String>,
}

pub struct Controller {
    backend: Box<dyn ContainerBackend>,
    recipe: Recipe,
    containers: Map<ContainerName, Container>,
}

impl Controller {
    pub fn init<B>(backend: B, recipe: Recipe) -> Result<Controller>
    where
        B: 'static + ContainerBackend,
    {
        let mut backend = Box::new(backend);
        let containers =
            backend.list_containers(vec![(LABEL_PROJECT, recipe.project_name.as_str())])?;

        Ok(Controller {
            backend,
            recipe,
            containers,
        })
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    /// Checks the dependency manifest and the source tree before anything is
    /// handed to the runtime. Returns the plan to build.
    pub fn preflight(&self) -> Result<BuildPlan> {
        preflight(&self.recipe)
    }

    pub fn build_image(
        &mut self,
        policy: BuildPolicy,
        pull: bool,
        output: &mut dyn FnMut(&str),
    ) -> Result<BuildReport> {
        let plan = self.preflight()?;
        let dockerfile = plan.render();

        let context = BuildContext::assemble(&self.recipe.context, &dockerfile)?;
        info!(
            "archived {} bytes of build context into {:?}",
            context.size(),
            context.archive()
        );

        if policy == BuildPolicy::IfChanged {
            if let Some(image) = self.backend.get_image(&self.recipe.image_name)? {
                if image.labels.get(LABEL_HASH).map(String::as_str) == Some(context.digest()) {
                    info!("image {} is up to date", self.recipe.image_name);
                    let context_size = context.size();
                    context.close()?;
                    return Ok(BuildReport {
                        image_id: image.id,
                        rebuilt: false,
                        context_size,
                    });
                }
            }
        }

        let mut labels = Map::new();
        labels.insert(LABEL_PROJECT.into(), self.recipe.project_name.clone());
        labels.insert(LABEL_HASH.into(), context.digest().into());
        labels.insert(
            LABEL_LAUNCH_MODE.into(),
            self.recipe.launch.mode.as_str().into(),
        );

        let spec = ImageBuildSpec {
            name: self.recipe.image_name.clone(),
            context_archive: context.archive().to_path_buf(),
            dockerfile: DOCKERFILE_NAME.into(),
            labels,
            pull,
        };

        let context_size = context.size();
        let mut tracker = plan.tracker();
        let outcome = self.backend.build_image(spec, &mut |line: &str| {
            tracker.observe(line);
            output(line);
        })?;
        context.close()?;

        let image_id = match outcome {
            BuildOutcome::Built(image_id) => image_id,
            BuildOutcome::Failed { status } => {
                let stage = tracker.fail();

                if stage == BuildStage::Verified || !tracker.missing_packages().is_empty() {
                    let mut packages = tracker.missing_packages().to_vec();
                    if packages.is_empty() {
                        packages = self.recipe.required_packages.0.clone();
                    }
                    return Err(BuildError::DependencyNotInstalled { packages }.into());
                }

                return Err(BuildError::StepFailed { stage, status }.into());
            }
        };

        tracker.finish()?;
        info!("built image {:?}", image_id);

        self.verify_image()?;

        Ok(BuildReport {
            image_id,
            rebuilt: true,
            context_size,
        })
    }

    /// Queries the built image for every required package.
    pub fn verify_image(&mut self) -> Result<()> {
        if self.backend.get_image(&self.recipe.image_name)?.is_none() {
            bail!("image {} hasn't been built", self.recipe.image_name);
        }

        let packages = self.recipe.required_packages.iter().collect::<Vec<_>>();
        let missing = self
            .backend
            .missing_packages(&self.recipe.image_name, &packages)?;

        if missing.is_empty() {
            info!("image {} has all required packages", self.recipe.image_name);
            Ok(())
        } else {
            Err(BuildError::DependencyNotInstalled { packages: missing }.into())
        }
    }

    /// The container this project should be running.
    pub fn container_spec(&mut self, options: &LaunchOptions) -> Result<ContainerSpec> {
        let mode = self.recipe.launch.mode;
        let baked_port = self.recipe.port;

        let env_port = match options.env.get(PORT_VARIABLE) {
            Some(port) => Some(
                port.parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| anyhow!("{} must be a port number, got {:?}", PORT_VARIABLE, port))?,
            ),
            None => None,
        };

        let port = match (options.port, env_port) {
            (Some(a), Some(b)) if a != b => {
                bail!("--port {} conflicts with {}={}", a, PORT_VARIABLE, b)
            }
            (Some(port), _) | (None, Some(port)) => port,
            (None, None) => baked_port,
        };

        if port != baked_port && !mode.honors_port_override() {
            warn!(
                "launch mode {} binds --server.port={} at build time",
                mode, baked_port
            );
            bail!(
                "launch mode {} can't move to port {}, change `port` in the recipe and rebuild",
                mode,
                port
            );
        }

        let mut env = options.env.clone();
        if port != baked_port {
            env.insert(PORT_VARIABLE.into(), port.to_string());
        }

        let image = self
            .backend
            .get_image(&self.recipe.image_name)?
            .ok_or_else(|| anyhow!("image {} hasn't been built", self.recipe.image_name))?;

        Ok(ContainerSpec {
            name: self.recipe.container_name(),
            image_name: self.recipe.image_name.clone(),
            ports: vec![PortMapping {
                host: options.host_port.unwrap_or(port),
                container: port,
            }],
            env,
            labels: {
                let mut labels = Map::new();
                labels.insert(LABEL_LAUNCH_MODE.into(), mode.as_str().into());
                labels.insert(LABEL_IMAGE.into(), image.id.0);
                labels
            },
        })
    }

    pub fn start_containers_diff(
        &mut self,
        spec: &ContainerSpec,
    ) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let spec_hash = spec_hash(spec);

        let container = match self.containers.get(&spec.name) {
            Some(container) => container,
            None => return Ok(vec![(spec.name.clone(), ContainerOperation::Create)]),
        };

        let container_hash = container.labels.get(LABEL_HASH);
        let operation = if container_hash.map(|h| *h == spec_hash).unwrap_or(false) {
            match container.status {
                ContainerStatus::Configured => Some(ContainerOperation::Start),
                ContainerStatus::Running => None,
                ContainerStatus::Exited => Some(ContainerOperation::Start),
                ContainerStatus::Unknown => Some(ContainerOperation::Recreate),
            }
        } else {
            Some(ContainerOperation::Recreate)
        };

        Ok(operation
            .map(|operation| (spec.name.clone(), operation))
            .into_iter()
            .collect())
    }

    pub fn stop_containers_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let diff = self
            .containers
            .values()
            .filter(|container| container.status == ContainerStatus::Running)
            .map(|container| (container.name.clone(), ContainerOperation::Stop))
            .collect();

        Ok(diff)
    }

    pub fn remove_containers_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let diff = self
            .containers
            .keys()
            .map(|name| (name.clone(), ContainerOperation::Remove))
            .collect();

        Ok(diff)
    }

    pub fn container_apply(
        &mut self,
        name: &ContainerName,
        operation: ContainerOperation,
        spec: Option<&ContainerSpec>,
        timeout: u32,
    ) -> Result<()> {
        let container_spec = || -> Result<ContainerSpec> {
            spec.filter(|spec| spec.name == *name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown container name: {:?}", name))
        };

        match operation {
            ContainerOperation::Create => {
                let container_spec = container_spec()?;
                let container_id = self.container_create(container_spec)?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Recreate => {
                let container_spec = container_spec()?;
                let container = self
                    .containers
                    .get(name)
                    .ok_or_else(|| anyhow!("could not find container {:?}", name))?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
                let container_id = self.container_create(container_spec)?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Start => {
                let container = self
                    .containers
                    .get(name)
                    .ok_or_else(|| anyhow!("could not find container {:?}", name))?;
                self.backend.start_container(&container.id.0)?;
            }
            ContainerOperation::Stop => {
                let container = self
                    .containers
                    .get(name)
                    .ok_or_else(|| anyhow!("could not find container {:?}", name))?;
                self.backend.stop_container(&container.id.0, timeout)?;
            }
            ContainerOperation::Remove => {
                let container = self
                    .containers
                    .get(name)
                    .ok_or_else(|| anyhow!("could not find container {:?}", name))?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
            }
        }

        Ok(())
    }

    pub fn container_create(&mut self, mut spec: ContainerSpec) -> Result<ContainerId> {
        let hash = spec_hash(&spec);

        spec.labels
            .insert(LABEL_PROJECT.into(), self.recipe.project_name.clone());
        spec.labels.insert(LABEL_HASH.into(), hash);

        let id = self.backend.create_container(spec)?;

        Ok(id)
    }
}

fn spec_hash(spec: &ContainerSpec) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.input(spec);
    hasher.finalize().to_hex().to_string()
}

/// Fails before any build when the manifest can't satisfy the required
/// packages or the source tree is missing.
pub fn preflight(recipe: &Recipe) -> Result<BuildPlan> {
    let manifest_path = recipe.context.join(&recipe.manifest);
    let manifest = Manifest::from_path(&manifest_path)?;
    manifest.check(&recipe.required_packages)?;
    info!(
        "checked {} against {} required packages",
        recipe.manifest,
        recipe.required_packages.0.len()
    );

    let source = recipe.context.join(recipe.source.from.trim_end_matches('/'));
    if !source.is_dir() {
        bail!("source directory {:?} doesn't exist", source);
    }

    Ok(plan(recipe))
}

/// Lays out the build steps, leaving out a configuration directory that
/// isn't in the build context.
pub fn plan(recipe: &Recipe) -> BuildPlan {
    let include_config_dir = match &recipe.config_dir {
        Some(config_dir) => {
            let path = recipe.context.join(config_dir.from.trim_end_matches('/'));
            let exists = path.is_dir();
            if !exists {
                warn!("configuration directory {:?} doesn't exist, leaving it out", path);
            }
            exists
        }
        None => false,
    };

    BuildPlan::from_recipe(recipe, include_config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontends::YamlRecipeFrontend,
        launch::LaunchMode,
        models::{Image, ImageBuildSpec, ImageName},
        services::RecipeFrontend,
    };
    use std::{cell::RefCell, fs, rc::Rc};
    use tempfile::TempDir;

    #[derive(Default)]
    struct State {
        images: Map<ImageName, Image>,
        containers: Map<ContainerName, Container>,
        builds: Vec<ImageBuildSpec>,
        build_output: Vec<String>,
        build_status: Option<i32>,
        installed: Vec<String>,
        verifications: usize,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeBackend(Rc<RefCell<State>>);

    impl ContainerBackend for FakeBackend {
        fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
            Ok(self.0.borrow().images.get(name).cloned())
        }

        fn build_image(
            &mut self,
            spec: ImageBuildSpec,
            output: &mut dyn FnMut(&str),
        ) -> Result<BuildOutcome> {
            let mut state = self.0.borrow_mut();
            assert!(spec.context_archive.exists());

            for line in state.build_output.iter() {
                output(line);
            }

            if let Some(status) = state.build_status {
                return Ok(BuildOutcome::Failed { status });
            }

            let id = ImageId(format!("sha256:{}", state.builds.len()));
            state.images.insert(
                spec.name.clone(),
                Image {
                    id: id.clone(),
                    labels: spec.labels.clone(),
                },
            );
            state.builds.push(spec);
            Ok(BuildOutcome::Built(id))
        }

        fn missing_packages(
            &mut self,
            _image: &ImageName,
            packages: &[&str],
        ) -> Result<Vec<String>> {
            let mut state = self.0.borrow_mut();
            state.verifications += 1;
            Ok(packages
                .iter()
                .filter(|package| !state.installed.iter().any(|p| p == *package))
                .map(|package| (*package).to_owned())
                .collect())
        }

        fn list_containers(
            &mut self,
            labels: Vec<(&str, &str)>,
        ) -> Result<Map<ContainerName, Container>> {
            let state = self.0.borrow();
            Ok(state
                .containers
                .iter()
                .filter(|(_, container)| {
                    labels.iter().all(|(key, value)| {
                        container.labels.get(*key).map(String::as_str) == Some(*value)
                    })
                })
                .map(|(name, container)| (name.clone(), container.clone()))
                .collect())
        }

        fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
            let mut state = self.0.borrow_mut();
            state.calls.push(format!("create {}", spec.name.0));
            let id = ContainerId(format!("id-{}", spec.name.0));
            state.containers.insert(
                spec.name.clone(),
                Container {
                    id: id.clone(),
                    name: spec.name.clone(),
                    status: ContainerStatus::Configured,
                    labels: spec.labels.clone(),
                },
            );
            Ok(id)
        }

        fn start_container(&mut self, name: &str) -> Result<ContainerId> {
            self.0.borrow_mut().calls.push(format!("start {}", name));
            Ok(ContainerId(name.into()))
        }

        fn stop_container(&mut self, name: &str, _timeout: u32) -> Result<ContainerId> {
            self.0.borrow_mut().calls.push(format!("stop {}", name));
            Ok(ContainerId(name.into()))
        }

        fn remove_container(&mut self, name: &str, _remove_volumes: bool) -> Result<ContainerId> {
            self.0.borrow_mut().calls.push(format!("rm {}", name));
            Ok(ContainerId(name.into()))
        }
    }

    const ALL_PACKAGES: &str = "streamlit==1.22.0\ngoogle-cloud-storage==2.9.0\nuvicorn==0.22.0\n";

    fn project(recipe: &str, requirements: &str) -> (TempDir, Recipe) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dashpack.yml"), recipe).unwrap();
        fs::write(dir.path().join("requirements.txt"), requirements).unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.py"), "app = None\n").unwrap();
        fs::create_dir(dir.path().join(".streamlit")).unwrap();
        fs::write(dir.path().join(".streamlit/config.toml"), "[server]\n").unwrap();

        let recipe = YamlRecipeFrontend::new()
            .recipe("weather", dir.path().join("dashpack.yml"))
            .unwrap();
        (dir, recipe)
    }

    fn installed_everything(backend: &FakeBackend) {
        backend.0.borrow_mut().installed = vec![
            "streamlit".into(),
            "google-cloud-storage".into(),
            "uvicorn".into(),
        ];
    }

    fn build_error(err: anyhow::Error) -> BuildError {
        err.downcast::<BuildError>().expect("expected a build error")
    }

    #[test]
    fn builds_and_verifies_image() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        installed_everything(&backend);

        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        let report = controller
            .build_image(BuildPolicy::IfChanged, false, &mut |_| ())
            .unwrap();

        assert_eq!(report.image_id, ImageId("sha256:0".into()));
        assert!(report.rebuilt);
        assert!(report.context_size > 0);

        let state = backend.0.borrow();
        let spec = &state.builds[0];
        assert_eq!(spec.name, ImageName("weather_dashboard".into()));
        assert_eq!(spec.dockerfile, DOCKERFILE_NAME);
        assert_eq!(spec.labels.get(LABEL_LAUNCH_MODE).unwrap(), "asgi");
        assert!(spec.labels.contains_key(LABEL_HASH));
    }

    #[test]
    fn unchanged_inputs_skip_the_rebuild() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        installed_everything(&backend);

        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        controller
            .build_image(BuildPolicy::IfChanged, false, &mut |_| ())
            .unwrap();
        let second = controller
            .build_image(BuildPolicy::IfChanged, false, &mut |_| ())
            .unwrap();
        assert_eq!(second.image_id, ImageId("sha256:0".into()));
        assert!(!second.rebuilt);

        let forced = controller
            .build_image(BuildPolicy::Always, false, &mut |_| ())
            .unwrap();
        assert_eq!(forced.image_id, ImageId("sha256:1".into()));
        assert!(forced.rebuilt);

        let state = backend.0.borrow();
        assert_eq!(
            state.builds[0].labels.get(LABEL_HASH),
            state.builds[1].labels.get(LABEL_HASH)
        );
    }

    #[test]
    fn manifest_without_uvicorn_never_reaches_the_runtime() {
        let (_dir, recipe) = project("", "streamlit==1.22.0\ngoogle-cloud-storage==2.9.0\n");
        let backend = FakeBackend::default();

        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        let err = controller
            .build_image(BuildPolicy::Always, false, &mut |_| ())
            .unwrap_err();

        assert!(err.to_string().contains("Dependency not installed"));
        match build_error(err) {
            BuildError::DependencyNotInstalled { packages } => {
                assert_eq!(packages, vec!["uvicorn".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(backend.0.borrow().builds.is_empty());
    }

    #[test]
    fn verification_step_failure_is_a_dependency_error() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        backend.0.borrow_mut().build_output = vec![
            "STEP 6/12: RUN pip install --no-cache-dir -r requirements.txt".into(),
            "STEP 7/12: RUN for pkg in streamlit google-cloud-storage uvicorn; do".into(),
            "Dependency not installed: google-cloud-storage".into(),
        ];
        backend.0.borrow_mut().build_status = Some(1);

        let mut controller = Controller::init(backend, recipe).unwrap();
        let err = build_error(
            controller
                .build_image(BuildPolicy::Always, false, &mut |_| ())
                .unwrap_err(),
        );

        match err {
            BuildError::DependencyNotInstalled { packages } => {
                assert_eq!(packages, vec!["google-cloud-storage".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn toolchain_failure_propagates_status() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        backend.0.borrow_mut().build_output = vec![
            "STEP 3/12: RUN pip install --upgrade pip".into(),
            "STEP 4/12: RUN apt-get update".into(),
            "E: Unable to locate package gcc".into(),
        ];
        backend.0.borrow_mut().build_status = Some(100);

        let mut controller = Controller::init(backend, recipe).unwrap();
        let err = build_error(
            controller
                .build_image(BuildPolicy::Always, false, &mut |_| ())
                .unwrap_err(),
        );

        match err {
            BuildError::StepFailed { stage, status } => {
                assert_eq!(stage, BuildStage::ToolchainInstalled);
                assert_eq!(status, 100);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn built_image_missing_a_package_fails_verification() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        backend.0.borrow_mut().installed = vec!["streamlit".into(), "uvicorn".into()];

        let mut controller = Controller::init(backend, recipe).unwrap();
        let err = build_error(
            controller
                .build_image(BuildPolicy::Always, false, &mut |_| ())
                .unwrap_err(),
        );

        match err {
            BuildError::DependencyNotInstalled { packages } => {
                assert_eq!(packages, vec!["google-cloud-storage".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn verifying_before_a_build_reports_the_missing_image() {
        let (_dir, recipe) = project("", ALL_PACKAGES);
        let backend = FakeBackend::default();
        installed_everything(&backend);

        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        let err = controller.verify_image().unwrap_err();

        assert!(err.downcast_ref::<BuildError>().is_none());
        assert!(err.to_string().contains("hasn't been built"));
        assert_eq!(backend.0.borrow().verifications, 0);

        controller
            .build_image(BuildPolicy::Always, false, &mut |_| ())
            .unwrap();
        controller.verify_image().unwrap();
        assert_eq!(backend.0.borrow().verifications, 2);
    }

    #[test]
    fn manifest_with_wheel_url_defers_to_the_image_check() {
        let (_dir, recipe) = project(
            "",
            "https://files.example.com/streamlit-1.22.0-py3-none-any.whl\ngoogle-cloud-storage\nuvicorn\n./vendor/charts\n",
        );

        let dockerfile = preflight(&recipe).unwrap().render();
        assert!(dockerfile.contains("pip show"));
    }

    #[test]
    fn missing_source_directory_fails_preflight() {
        let (dir, recipe) = project("", ALL_PACKAGES);
        fs::remove_dir_all(dir.path().join("src")).unwrap();

        assert!(preflight(&recipe).is_err());
    }

    #[test]
    fn missing_config_directory_is_left_out() {
        let (dir, recipe) = project("", ALL_PACKAGES);
        fs::remove_dir_all(dir.path().join(".streamlit")).unwrap();

        let dockerfile = preflight(&recipe).unwrap().render();
        assert!(!dockerfile.contains(".streamlit"));
        assert!(dockerfile.contains("COPY src/ ./src/"));
    }

    fn built_controller(recipe_yaml: &str) -> (TempDir, FakeBackend, Controller) {
        let (dir, recipe) = project(recipe_yaml, ALL_PACKAGES);
        let backend = FakeBackend::default();
        installed_everything(&backend);

        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        controller
            .build_image(BuildPolicy::Always, false, &mut |_| ())
            .unwrap();
        (dir, backend, controller)
    }

    #[test]
    fn default_launch_publishes_8000() {
        let (_dir, _backend, mut controller) = built_controller("");
        let spec = controller.container_spec(&LaunchOptions::default()).unwrap();

        assert_eq!(spec.name, ContainerName("weather_dashboard".into()));
        assert_eq!(
            spec.ports,
            vec![PortMapping {
                host: 8000,
                container: 8000
            }]
        );
        assert!(spec.env.get(PORT_VARIABLE).is_none());
    }

    #[test]
    fn asgi_port_override_moves_the_bind_port() {
        let (_dir, _backend, mut controller) = built_controller("");
        let options = LaunchOptions {
            port: Some(9000),
            ..Default::default()
        };
        let spec = controller.container_spec(&options).unwrap();

        assert_eq!(spec.env.get(PORT_VARIABLE).unwrap(), "9000");
        assert_eq!(
            spec.ports,
            vec![PortMapping {
                host: 9000,
                container: 9000
            }]
        );
    }

    #[test]
    fn cli_mode_rejects_port_override() {
        let (_dir, _backend, mut controller) = built_controller("launch: { mode: cli }\n");
        assert_eq!(controller.recipe().launch.mode, LaunchMode::Cli);

        let options = LaunchOptions {
            port: Some(9000),
            ..Default::default()
        };
        assert!(controller.container_spec(&options).is_err());

        let mut env = Map::new();
        env.insert(PORT_VARIABLE.to_string(), "9000".to_string());
        let options = LaunchOptions {
            env,
            ..Default::default()
        };
        assert!(controller.container_spec(&options).is_err());

        let options = LaunchOptions {
            host_port: Some(18000),
            ..Default::default()
        };
        let spec = controller.container_spec(&options).unwrap();
        assert_eq!(
            spec.ports,
            vec![PortMapping {
                host: 18000,
                container: 8000
            }]
        );
    }

    #[test]
    fn up_creates_then_leaves_running_container_alone() {
        let (dir, backend, mut controller) = built_controller("");
        let spec = controller.container_spec(&LaunchOptions::default()).unwrap();

        let diff = controller.start_containers_diff(&spec).unwrap();
        assert_eq!(
            diff,
            vec![(spec.name.clone(), ContainerOperation::Create)]
        );
        for (name, operation) in diff {
            controller
                .container_apply(&name, operation, Some(&spec), 5)
                .unwrap();
        }
        assert_eq!(
            backend.0.borrow().calls,
            vec!["create weather_dashboard", "start id-weather_dashboard"]
        );

        backend
            .0
            .borrow_mut()
            .containers
            .values_mut()
            .for_each(|container| container.status = ContainerStatus::Running);

        let recipe = controller.recipe().clone();
        let mut controller = Controller::init(backend.clone(), recipe).unwrap();
        let spec = controller.container_spec(&LaunchOptions::default()).unwrap();
        assert!(controller.start_containers_diff(&spec).unwrap().is_empty());

        let options = LaunchOptions {
            port: Some(9000),
            ..Default::default()
        };
        let changed = controller.container_spec(&options).unwrap();
        assert_eq!(
            controller.start_containers_diff(&changed).unwrap(),
            vec![(changed.name.clone(), ContainerOperation::Recreate)]
        );

        assert_eq!(
            controller.stop_containers_diff().unwrap(),
            vec![(spec.name.clone(), ContainerOperation::Stop)]
        );
        assert_eq!(
            controller.remove_containers_diff().unwrap(),
            vec![(spec.name.clone(), ContainerOperation::Remove)]
        );
        drop(dir);
    }
}
