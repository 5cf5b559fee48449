use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::BuildError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub constraint: String,
}

impl Requirement {
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

/// An ordered `requirements.txt` style dependency manifest.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    pub requirements: Vec<Requirement>,
    /// Local paths and URLs, whose package names aren't known until pip
    /// builds them.
    pub unnamed: Vec<String>,
}

/// The packages whose presence must be proven before an image counts as
/// built. Fixed by configuration, never derived from the manifest.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequiredPackages(pub Vec<String>);

impl Default for RequiredPackages {
    fn default() -> Self {
        RequiredPackages(vec![
            "streamlit".into(),
            "google-cloud-storage".into(),
            "uvicorn".into(),
        ])
    }
}

impl RequiredPackages {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|name| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Package names compare case-insensitively with any run of `-`, `_` and
/// `.` treated as a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;

    for c in name.trim().chars() {
        if c == '-' || c == '_' || c == '.' {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.extend(c.to_lowercase());
            in_separator = false;
        }
    }

    normalized
}

impl Manifest {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("couldn't read dependency manifest {:?}", path))?;

        Manifest::parse(&contents).with_context(|| format!("in dependency manifest {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Manifest> {
        let mut requirements = Vec::new();
        let mut unnamed = Vec::new();

        for (line_number, line) in logical_lines(contents) {
            let line = strip_comment(&line);
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            if line.starts_with('-') {
                debug!("skipping manifest option on line {}: {}", line_number, line);
                continue;
            }

            if is_unnamed(line) {
                debug!("skipping unnamed requirement on line {}: {}", line_number, line);
                unnamed.push(line.to_owned());
                continue;
            }

            let requirement = parse_requirement(line)
                .ok_or_else(|| anyhow!("invalid requirement on line {}: {:?}", line_number, line))?;
            requirements.push(requirement);
        }

        Ok(Manifest {
            requirements,
            unnamed,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = normalize_name(name);
        self.requirements
            .iter()
            .any(|requirement| requirement.normalized_name() == name)
    }

    /// Required packages that the manifest doesn't list, in the order they
    /// were required.
    pub fn missing<'a>(&self, required: &'a RequiredPackages) -> Vec<&'a str> {
        required.iter().filter(|name| !self.contains(name)).collect()
    }

    /// Fails unless every required package is listed. When the manifest has
    /// unnamed requirements that could provide the missing packages, the
    /// check inside the image decides instead.
    pub fn check(&self, required: &RequiredPackages) -> Result<(), BuildError> {
        for requirement in self.requirements.iter() {
            if required.iter().any(|name| normalize_name(name) == requirement.normalized_name()) {
                debug!(
                    "required package {}[{}] {}",
                    requirement.name,
                    requirement.extras.join(","),
                    requirement.constraint
                );
            }
        }

        let missing = self.missing(required);

        if missing.is_empty() {
            Ok(())
        } else if !self.unnamed.is_empty() {
            warn!(
                "{} not listed by name, leaving it to the check inside the image",
                missing.join(", ")
            );
            Ok(())
        } else {
            Err(BuildError::DependencyNotInstalled {
                packages: missing.into_iter().map(String::from).collect(),
            })
        }
    }
}

/// Joins backslash continued lines, keeping the number of the first
/// physical line for diagnostics.
fn logical_lines(contents: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, line) in contents.lines().enumerate() {
        let (start, mut buffer) = pending.take().unwrap_or_else(|| (index + 1, String::new()));

        match line.strip_suffix('\\') {
            Some(head) => {
                buffer.push_str(head);
                pending = Some((start, buffer));
            }
            None => {
                buffer.push_str(line);
                lines.push((start, buffer));
            }
        }
    }

    if let Some(last) = pending {
        lines.push(last);
    }

    lines
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }

    let bytes = line.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && index > 0 && bytes[index - 1].is_ascii_whitespace() {
            return &line[..index];
        }
    }

    line
}

/// Local paths and URLs without a `name @` prefix. pip installs them, but
/// the package name is only known once they are built.
fn is_unnamed(line: &str) -> bool {
    if line.starts_with('.') || line.starts_with('/') || line.starts_with('~') {
        return true;
    }

    match (line.find("://"), line.find('@')) {
        (Some(scheme), Some(at)) => scheme < at,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn parse_requirement(line: &str) -> Option<Requirement> {
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or_else(|| line.len());

    let name = &line[..name_end];
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }

    let mut rest = line[name_end..].trim_start();
    let mut extras = Vec::new();

    if rest.starts_with('[') {
        let close = rest.find(']')?;
        extras = rest[1..close]
            .split(',')
            .map(str::trim)
            .filter(|extra| !extra.is_empty())
            .map(String::from)
            .collect();
        rest = rest[close + 1..].trim_start();
    }

    Some(Requirement {
        name: name.into(),
        extras,
        constraint: rest.trim().into(),
    })
}
