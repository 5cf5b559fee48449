use anyhow::{anyhow, Result};
use log::debug;
use std::fmt::{self, Write};

use crate::{
    error::DEPENDENCY_NOT_INSTALLED,
    launch::{StartupCommand, PORT_VARIABLE},
    models::{BaseImage, CopySpec, Recipe},
};

/// Where a build stands. Stages only move forward one at a time, a failure
/// ends the build in [`BuildState::Failed`].
#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub enum BuildStage {
    Init,
    BaseImage,
    ToolchainInstalled,
    DependenciesInstalled,
    Verified,
    SourceStaged,
    ConfigSet,
    CommandDefined,
    Built,
}

impl BuildStage {
    pub fn next(self) -> Option<BuildStage> {
        use BuildStage::*;

        match self {
            Init => Some(BaseImage),
            BaseImage => Some(ToolchainInstalled),
            ToolchainInstalled => Some(DependenciesInstalled),
            DependenciesInstalled => Some(Verified),
            Verified => Some(SourceStaged),
            SourceStaged => Some(ConfigSet),
            ConfigSet => Some(CommandDefined),
            CommandDefined => Some(Built),
            Built => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    At(BuildStage),
    Failed { at: BuildStage },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    From(BaseImage),
    Workdir(String),
    Run(String),
    Copy(CopySpec),
    Env(String, String),
    Expose(u16),
    Cmd(StartupCommand),
}

impl Instruction {
    /// Metadata-only instructions don't produce a filesystem layer, BuildKit
    /// leaves them out of its step count.
    fn is_layer(&self) -> bool {
        match self {
            Instruction::Env(..) | Instruction::Expose(_) | Instruction::Cmd(_) => false,
            _ => true,
        }
    }
}

/// Backslash escapes the characters the Dockerfile word parser treats
/// specially, so `$HOME` stays literal instead of being substituted.
fn escape_word(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if c == '\\' || c == '"' || c == '$' {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

fn quote(value: &str) -> String {
    format!("\"{}\"", escape_word(value))
}

/// Exec-form arguments are JSON decoded first and word processed after.
fn quote_json(value: &str) -> String {
    serde_json::Value::String(escape_word(value)).to_string()
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\' || c == '$')
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(image) => write!(f, "FROM {}", image.0),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {}", dir),
            Instruction::Run(command) => write!(f, "RUN {}", command),
            Instruction::Copy(spec) => {
                if needs_quoting(&spec.from) || needs_quoting(&spec.to) {
                    write!(
                        f,
                        "COPY [{}, {}]",
                        quote_json(&spec.from),
                        quote_json(&spec.to)
                    )
                } else {
                    write!(f, "COPY {} {}", spec.from, spec.to)
                }
            }
            Instruction::Env(key, value) => {
                if needs_quoting(value) {
                    write!(f, "ENV {}={}", key, quote(value))
                } else {
                    write!(f, "ENV {}={}", key, value)
                }
            }
            Instruction::Expose(port) => write!(f, "EXPOSE {}", port),
            Instruction::Cmd(command) => {
                let args = serde_json::to_string(command.args()).map_err(|_| fmt::Error)?;
                write!(f, "CMD {}", args)
            }
        }
    }
}

/// One rendered instruction and the stage the build reaches once it's done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub stage: BuildStage,
    pub instruction: Instruction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildPlan {
    pub steps: Vec<Step>,
}

fn directory_copy(spec: &CopySpec) -> CopySpec {
    fn with_slash(path: &str) -> String {
        if path.ends_with('/') {
            path.to_owned()
        } else {
            format!("{}/", path)
        }
    }

    CopySpec {
        from: with_slash(&spec.from),
        to: with_slash(&spec.to),
    }
}

pub fn verification_command<'a, I>(packages: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let packages = packages.into_iter().collect::<Vec<_>>().join(" ");

    format!(
        "for pkg in {}; do pip show \"$pkg\" > /dev/null 2>&1 || {{ echo \"{}: $pkg\"; exit 1; }}; done",
        packages, DEPENDENCY_NOT_INSTALLED
    )
}

impl BuildPlan {
    /// Lays the recipe out as the fixed, linear sequence of build steps.
    /// `include_config_dir` is false when the configuration directory is
    /// missing from the build context.
    pub fn from_recipe(recipe: &Recipe, include_config_dir: bool) -> BuildPlan {
        use BuildStage::*;

        let mut steps = Vec::new();
        let mut push = |stage, instruction| steps.push(Step { stage, instruction });

        push(BaseImage, Instruction::From(recipe.base_image.clone()));
        push(BaseImage, Instruction::Workdir(recipe.workdir.clone()));

        push(
            ToolchainInstalled,
            Instruction::Run("pip install --upgrade pip".into()),
        );
        if !recipe.os_packages.is_empty() {
            push(
                ToolchainInstalled,
                Instruction::Run(format!(
                    "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                    recipe.os_packages.join(" ")
                )),
            );
        }

        push(
            DependenciesInstalled,
            Instruction::Copy(CopySpec {
                from: recipe.manifest.clone(),
                to: ".".into(),
            }),
        );
        push(
            DependenciesInstalled,
            Instruction::Run(format!(
                "pip install --no-cache-dir -r {}",
                manifest_file_name(&recipe.manifest)
            )),
        );

        push(
            Verified,
            Instruction::Run(verification_command(recipe.required_packages.iter())),
        );

        push(SourceStaged, Instruction::Copy(directory_copy(&recipe.source)));
        if let Some(config_dir) = recipe.config_dir.as_ref().filter(|_| include_config_dir) {
            push(SourceStaged, Instruction::Copy(directory_copy(config_dir)));
        }

        push(
            ConfigSet,
            Instruction::Env(PORT_VARIABLE.into(), recipe.port.to_string()),
        );
        for (key, value) in recipe.environment.iter() {
            push(ConfigSet, Instruction::Env(key.clone(), value.clone()));
        }
        push(ConfigSet, Instruction::Expose(recipe.port));

        push(
            CommandDefined,
            Instruction::Cmd(recipe.launch.startup_command(recipe.port)),
        );

        BuildPlan { steps }
    }

    pub fn render(&self) -> String {
        let mut dockerfile = String::new();

        for step in self.steps.iter() {
            // Writing to a String can't fail.
            let _ = writeln!(dockerfile, "{}", step.instruction);
        }

        dockerfile
    }

    pub fn tracker(&self) -> BuildTracker {
        BuildTracker {
            steps: self.steps.iter().map(|step| step.stage).collect(),
            layer_steps: self
                .steps
                .iter()
                .filter(|step| step.instruction.is_layer())
                .map(|step| step.stage)
                .collect(),
            state: BuildState::At(BuildStage::Init),
            pending: BuildStage::BaseImage,
            missing_packages: Vec::new(),
        }
    }
}

/// `COPY requirements.txt .` lands the manifest in the working directory
/// under its own file name.
fn manifest_file_name(manifest: &str) -> &str {
    manifest.rsplit('/').next().unwrap_or(manifest)
}

/// Follows a running build through the runtime's progress output.
#[derive(Clone, Debug)]
pub struct BuildTracker {
    steps: Vec<BuildStage>,
    layer_steps: Vec<BuildStage>,
    state: BuildState,
    pending: BuildStage,
    missing_packages: Vec<String>,
}

impl BuildTracker {
    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn missing_packages(&self) -> &[String] {
        &self.missing_packages
    }

    pub fn advance(&mut self, to: BuildStage) -> Result<()> {
        let current = match self.state {
            BuildState::At(stage) => stage,
            BuildState::Failed { at } => {
                return Err(anyhow!("build already failed at {:?}", at));
            }
        };

        if current.next() != Some(to) {
            return Err(anyhow!(
                "illegal build transition from {:?} to {:?}",
                current,
                to
            ));
        }

        debug!("build stage {:?}", to);
        self.state = BuildState::At(to);
        self.pending = to.next().unwrap_or(to);

        Ok(())
    }

    /// Advances through every stage before `stage`, leaving `stage` pending.
    fn begin(&mut self, stage: BuildStage) {
        while let BuildState::At(current) = self.state {
            match current.next() {
                Some(next) if next < stage => {
                    self.state = BuildState::At(next);
                    debug!("build stage {:?}", next);
                }
                _ => break,
            }
        }

        if stage > self.pending {
            self.pending = stage;
        }
    }

    /// Feeds one line of build output.
    pub fn observe(&mut self, line: &str) {
        let (step, total) = match parse_step(line) {
            Some(step) => step,
            None => {
                self.observe_diagnostic(line);
                return;
            }
        };

        let stages = if total == self.steps.len() {
            &self.steps
        } else if total == self.layer_steps.len() {
            &self.layer_steps
        } else {
            debug!("ignoring step {}/{} that doesn't match the plan", step, total);
            return;
        };

        if let Some(stage) = step.checked_sub(1).and_then(|index| stages.get(index)) {
            let stage = *stage;
            self.begin(stage);
        }
    }

    fn observe_diagnostic(&mut self, line: &str) {
        let index = match line.find(DEPENDENCY_NOT_INSTALLED) {
            Some(index) => index,
            None => return,
        };

        let rest = &line[index + DEPENDENCY_NOT_INSTALLED.len()..];
        let package = rest.trim_start_matches(':').split_whitespace().next();

        if let Some(package) = package.filter(|package| !package.contains('$')) {
            self.missing_packages.push(package.to_owned());
        }
    }

    /// Marks the build as failed in whatever stage it was working towards.
    pub fn fail(&mut self) -> BuildStage {
        let at = match self.state {
            BuildState::Failed { at } => at,
            BuildState::At(_) => self.pending,
        };

        self.state = BuildState::Failed { at };
        at
    }

    /// Walks the remaining stages once the runtime reports success.
    pub fn finish(&mut self) -> Result<()> {
        while let BuildState::At(current) = self.state {
            match current.next() {
                Some(next) => self.advance(next)?,
                None => break,
            }
        }

        match self.state {
            BuildState::At(BuildStage::Built) => Ok(()),
            state => Err(anyhow!("build can't finish from {:?}", state)),
        }
    }
}

/// Recognizes `STEP 3/12:` (podman), `Step 3/12 :` (classic docker) and
/// `#7 [3/9] RUN ...` (BuildKit plain progress).
pub fn parse_step(line: &str) -> Option<(usize, usize)> {
    fn fraction(text: &str) -> Option<(usize, usize)> {
        let mut parts = text.trim().splitn(2, '/');
        let step = parts.next()?.trim().parse().ok()?;
        let total = parts.next()?.trim().parse().ok()?;
        Some((step, total))
    }

    let line = line.trim_start();

    for prefix in ["STEP ", "Step "].iter() {
        if let Some(rest) = line.strip_prefix(prefix) {
            let end = rest.find(':')?;
            return fraction(&rest[..end]);
        }
    }

    if line.starts_with('#') {
        let open = line.find('[')?;
        let close = open + line[open..].find(']')?;
        let inner = &line[open + 1..close];
        let last = inner.split_whitespace().last()?;
        return fraction(last);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        launch::{LaunchConfig, LaunchMode},
        manifest::RequiredPackages,
        models::ImageName,
    };
    use std::{collections::BTreeMap as Map, path::PathBuf};

    fn recipe() -> Recipe {
        Recipe {
            project_name: "weather".into(),
            context: PathBuf::from("."),
            image_name: ImageName("weather_dashboard".into()),
            base_image: BaseImage::default(),
            workdir: "/app".into(),
            os_packages: vec!["gcc".into(), "python3-dev".into()],
            manifest: "requirements.txt".into(),
            required_packages: RequiredPackages::default(),
            source: CopySpec {
                from: "src".into(),
                to: "./src/".into(),
            },
            config_dir: Some(CopySpec {
                from: ".streamlit".into(),
                to: "./.streamlit/".into(),
            }),
            port: 8000,
            environment: Map::new(),
            launch: LaunchConfig::default(),
        }
    }

    const EXPECTED: &str = r#"FROM python:3.9-slim
WORKDIR /app
RUN pip install --upgrade pip
RUN apt-get update && apt-get install -y --no-install-recommends gcc python3-dev && rm -rf /var/lib/apt/lists/*
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
RUN for pkg in streamlit google-cloud-storage uvicorn; do pip show "$pkg" > /dev/null 2>&1 || { echo "Dependency not installed: $pkg"; exit 1; }; done
COPY src/ ./src/
COPY .streamlit/ ./.streamlit/
ENV PORT=8000
EXPOSE 8000
CMD ["sh","-c","exec uvicorn src.main:app --host 0.0.0.0 --port ${PORT} --workers 1"]
"#;

    #[test]
    fn renders_default_recipe() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        assert_eq!(plan.render(), EXPECTED);
    }

    #[test]
    fn rendering_is_idempotent() {
        let first = BuildPlan::from_recipe(&recipe(), true).render();
        let second = BuildPlan::from_recipe(&recipe(), true).render();
        assert_eq!(first, second);
    }

    #[test]
    fn exposes_only_the_configured_port() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let exposed = plan
            .steps
            .iter()
            .filter_map(|step| match step.instruction {
                Instruction::Expose(port) => Some(port),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(exposed, vec![8000]);
    }

    #[test]
    fn cli_mode_and_extras() {
        let mut recipe = recipe();
        recipe.launch.mode = LaunchMode::Cli;
        recipe.os_packages.clear();
        recipe
            .environment
            .insert("GREETING".into(), "hello world".into());

        let dockerfile = BuildPlan::from_recipe(&recipe, false).render();

        assert!(!dockerfile.contains("apt-get"));
        assert!(!dockerfile.contains(".streamlit"));
        assert!(dockerfile.contains("ENV GREETING=\"hello world\"\n"));
        assert!(dockerfile.contains(
            "CMD [\"streamlit\",\"run\",\"src/main.py\",\"--server.port=8000\",\"--server.address=0.0.0.0\"]"
        ));
    }

    #[test]
    fn env_values_stay_literal() {
        let env = Instruction::Env("DB_PASSWORD".into(), "pa$$word $HOME".into());
        assert_eq!(env.to_string(), r#"ENV DB_PASSWORD="pa\$\$word \$HOME""#);

        let env = Instruction::Env("GREETING".into(), r#"say "hi" \o/"#.into());
        assert_eq!(env.to_string(), r#"ENV GREETING="say \"hi\" \\o/""#);

        let env = Instruction::Env("PLAIN".into(), "value".into());
        assert_eq!(env.to_string(), "ENV PLAIN=value");
    }

    #[test]
    fn copy_paths_with_specials_use_exec_form() {
        let copy = Instruction::Copy(CopySpec {
            from: "my app/".into(),
            to: "./$app/".into(),
        });
        assert_eq!(copy.to_string(), r#"COPY ["my app/", "./\\$app/"]"#);
    }

    #[test]
    fn stages_follow_the_fixed_order() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let stages = plan.steps.iter().map(|step| step.stage).collect::<Vec<_>>();

        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
        assert_eq!(stages.first(), Some(&BuildStage::BaseImage));
        assert_eq!(stages.last(), Some(&BuildStage::CommandDefined));
    }

    #[test]
    fn parses_runtime_progress_lines() {
        assert_eq!(parse_step("STEP 3/13: RUN pip install"), Some((3, 13)));
        assert_eq!(parse_step("Step 7/13 : RUN for pkg"), Some((7, 13)));
        assert_eq!(parse_step("#9 [4/9] RUN apt-get update"), Some((4, 9)));
        assert_eq!(parse_step("#9 [stage-0 4/9] COPY . ."), Some((4, 9)));
        assert_eq!(parse_step("#1 [internal] load build definition"), None);
        assert_eq!(parse_step("Collecting streamlit"), None);
    }

    #[test]
    fn tracks_failure_in_verification() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let mut tracker = plan.tracker();

        tracker.observe("STEP 1/12: FROM python:3.9-slim");
        tracker.observe("STEP 6/12: RUN pip install --no-cache-dir -r requirements.txt");
        tracker.observe(
            "STEP 7/12: RUN for pkg in streamlit; do pip show \"$pkg\" || { echo \"Dependency not installed: $pkg\"; exit 1; }; done",
        );
        tracker.observe("Dependency not installed: uvicorn");

        assert_eq!(tracker.state(), BuildState::At(BuildStage::DependenciesInstalled));
        assert_eq!(tracker.fail(), BuildStage::Verified);
        assert_eq!(tracker.state(), BuildState::Failed { at: BuildStage::Verified });
        assert_eq!(tracker.missing_packages(), &["uvicorn".to_string()]);
        assert!(tracker.finish().is_err());
    }

    #[test]
    fn tracks_buildkit_layer_steps() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let mut tracker = plan.tracker();

        // FROM, WORKDIR, two RUNs, COPY, RUN, verify RUN, two COPYs
        tracker.observe("#5 [3/9] RUN pip install --upgrade pip");
        assert_eq!(tracker.fail(), BuildStage::ToolchainInstalled);
    }

    #[test]
    fn finish_walks_to_built() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let mut tracker = plan.tracker();

        tracker.observe("STEP 12/12: CMD [\"sh\"]");
        tracker.finish().unwrap();
        assert_eq!(tracker.state(), BuildState::At(BuildStage::Built));
    }

    #[test]
    fn rejects_skipping_stages() {
        let plan = BuildPlan::from_recipe(&recipe(), true);
        let mut tracker = plan.tracker();

        assert!(tracker.advance(BuildStage::Verified).is_err());
        tracker.advance(BuildStage::BaseImage).unwrap();
        tracker.fail();
        assert!(tracker.advance(BuildStage::ToolchainInstalled).is_err());
    }
}
