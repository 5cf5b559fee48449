use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap as Map,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    launch::{LaunchConfig, PORT_VARIABLE},
    manifest::RequiredPackages,
    models::{BaseImage, CopySpec, ImageName, Recipe},
    services::RecipeFrontend,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RecipeFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    base_image: BaseImage,
    workdir: String,
    os_packages: Vec<String>,
    manifest: String,
    required_packages: RequiredPackages,
    source: Directory,
    /// `null` leaves the configuration directory out, a missing key keeps
    /// the default.
    config_dir: Option<Directory>,
    port: u16,
    environment: MapList,
    launch: LaunchConfig,
}

impl Default for RecipeFile {
    fn default() -> Self {
        RecipeFile {
            image: None,
            base_image: BaseImage::default(),
            workdir: "/app".into(),
            os_packages: vec!["gcc".into(), "python3-dev".into()],
            manifest: "requirements.txt".into(),
            required_packages: RequiredPackages::default(),
            source: Directory::Extended {
                from: "src".into(),
                to: "./src/".into(),
            },
            config_dir: Some(Directory::Extended {
                from: ".streamlit".into(),
                to: "./.streamlit/".into(),
            }),
            port: 8000,
            environment: MapList::default(),
            launch: LaunchConfig::default(),
        }
    }
}

/// A directory copied into the image, either `src` (same path under the
/// working directory) or `{ from: src, to: ./app/ }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Directory {
    Short(String),
    Extended { from: String, to: String },
}

impl Directory {
    fn into_copy_spec(self) -> CopySpec {
        match self {
            Directory::Short(from) => CopySpec {
                to: format!("./{}/", from.trim_end_matches('/')),
                from,
            },
            Directory::Extended { from, to } => CopySpec { from, to },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::Map(Map::new())
    }
}

impl MapList {
    fn to_map(self) -> Map<String, String> {
        match self {
            MapList::Map(map) => map,
            MapList::List(list) => list.into_iter().map(|value| split_value(&value)).collect(),
        }
    }
}

/// Splits `KEY=VALUE`, a bare `KEY` maps to an empty value.
pub fn split_value(value: &str) -> (String, String) {
    match value.find('=') {
        Some(split_index) => {
            let (key, value) = value.split_at(split_index);
            (key.into(), value[1..].into())
        }
        None => (value.into(), "".into()),
    }
}

fn is_package_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_os_package(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-+.:=~".contains(c))
}

fn is_shell_word(word: &str) -> bool {
    !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
}

pub fn is_env_key(key: &str) -> bool {
    key.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate(file: &RecipeFile) -> Result<()> {
    if !file.workdir.starts_with('/') {
        bail!("workdir must be an absolute path, got {:?}", file.workdir);
    }

    if file.port == 0 {
        bail!("port must be between 1 and 65535");
    }

    if file.required_packages.is_empty() {
        bail!("required_packages can't be empty");
    }

    if let Some(name) = file.required_packages.iter().find(|name| !is_package_name(name)) {
        bail!("invalid required package name {:?}", name);
    }

    if let Some(name) = file.os_packages.iter().find(|name| !is_os_package(name)) {
        bail!("invalid os package name {:?}", name);
    }

    if !is_shell_word(&file.manifest) || file.manifest.ends_with('/') {
        bail!("invalid manifest path {:?}", file.manifest);
    }

    if !is_shell_word(&file.launch.target) || !file.launch.target.contains(':') {
        bail!(
            "launch target must look like module:callable, got {:?}",
            file.launch.target
        );
    }

    if file.launch.script.trim().is_empty() {
        bail!("launch script can't be empty");
    }

    Ok(())
}

fn validate_environment(environment: &Map<String, String>) -> Result<()> {
    for (key, value) in environment.iter() {
        if key == PORT_VARIABLE {
            bail!("set the port with `port`, not through environment");
        }

        if !is_env_key(key) {
            bail!("invalid environment variable name {:?}", key);
        }

        if value.chars().any(char::is_control) {
            bail!("environment variable {} can't hold control characters", key);
        }
    }

    Ok(())
}

/// Image references and container names only take lowercase letters,
/// digits, `_`, `.` and `-`, starting with a letter or digit.
fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());

    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }

    sanitized
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .trim_end_matches('_')
        .into()
}

fn resolve(project_name: &str, context: PathBuf, file: RecipeFile) -> Result<Recipe> {
    validate(&file)?;

    let project_name = sanitize_name(project_name);
    if project_name.is_empty() {
        bail!("can't derive a project name from the directory name");
    }

    let environment = file.environment.to_map();
    validate_environment(&environment)?;

    let source = file.source.into_copy_spec();
    if source.from.trim_matches('/').is_empty() {
        bail!("source directory can't be empty");
    }

    let image_name = match file.image {
        Some(image) => ImageName(image),
        None => ImageName(format!("{}_dashboard", project_name)),
    };

    Ok(Recipe {
        project_name,
        context,
        image_name,
        base_image: file.base_image,
        workdir: file.workdir,
        os_packages: file.os_packages,
        manifest: file.manifest,
        required_packages: file.required_packages,
        source,
        config_dir: file.config_dir.map(Directory::into_copy_spec),
        port: file.port,
        environment,
        launch: file.launch,
    })
}

/// A file with nothing but comments or document markers means all defaults.
fn is_blank(contents: &str) -> bool {
    contents.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

/// Contents written by `dashpack init`.
pub fn default_recipe_file() -> Result<String> {
    Ok(serde_yaml::to_string(&RecipeFile::default())?)
}

pub struct YamlRecipeFrontend;

impl YamlRecipeFrontend {
    pub fn new() -> YamlRecipeFrontend {
        YamlRecipeFrontend
    }
}

impl RecipeFrontend for YamlRecipeFrontend {
    fn recipe<P: AsRef<Path>>(&mut self, project_name: &str, recipe_file_path: P) -> Result<Recipe> {
        let recipe_file_path = recipe_file_path.as_ref();
        let contents = fs::read_to_string(recipe_file_path)
            .with_context(|| format!("couldn't read {:?}", recipe_file_path))?;

        let file: RecipeFile = if is_blank(&contents) {
            RecipeFile::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("invalid recipe in {:?}", recipe_file_path))?
        };

        let context = recipe_file_path
            .parent()
            .ok_or_else(|| anyhow!("recipe file has no parent directory"))?
            .to_path_buf();

        resolve(project_name, context, file)
    }
}
