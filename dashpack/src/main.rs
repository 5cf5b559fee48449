use anyhow::{anyhow, bail, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::info;
use number_prefix::NumberPrefix;
use std::{
    collections::BTreeMap as Map,
    env, fs,
    io::{stderr, stdout, Write},
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

use backends::CliBackend;
use controller::{ContainerOperation, Controller, LaunchOptions};
use error::BuildError;
use frontends::{default_recipe_file, is_env_key, split_value, YamlRecipeFrontend};
use models::{BuildPolicy, ContainerName, ContainerSpec, Recipe};
use services::RecipeFrontend;

mod backends;
mod context;
mod controller;
mod error;
mod frontends;
mod hasher;
mod launch;
mod manifest;
mod models;
mod pipeline;
mod services;

const RECIPE_FILE_NAMES: [&str; 2] = ["dashpack.yml", "dashpack.yaml"];

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dashpack",
    about = "Packages a Python dashboard into a container image and runs it."
)]
struct Opt {
    /// Container runtime binary, anything with a docker compatible command line.
    #[structopt(long, env = "DASHPACK_RUNTIME", default_value = "podman")]
    runtime: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Writes a dashpack.yml with the default recipe to the current directory.
    Init,
    /// Prints the Dockerfile rendered from the recipe.
    Render,
    /// Checks that the dependency manifest lists every required package.
    Check,
    /// Prints the container's startup command as JSON.
    Command,
    /// Builds the image and verifies its required packages.
    Build {
        #[structopt(long)]
        /// Always pull a newer base image.
        pull: bool,

        #[structopt(long)]
        /// Rebuild even if nothing changed since the last build.
        force: bool,
    },
    /// Queries an existing image for the required packages.
    Verify,
    /// Builds the image if needed and starts the dashboard container.
    Up {
        #[structopt(long)]
        /// Rebuild the image even if nothing changed.
        build: bool,

        #[structopt(long)]
        /// Port the dashboard binds inside the container.
        port: Option<u16>,

        #[structopt(long)]
        /// Host port to publish, defaults to the container port.
        host_port: Option<u16>,

        #[structopt(short, long = "env", number_of_values = 1)]
        /// Extra KEY=VALUE environment for the container.
        env: Vec<String>,

        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
    /// Stops the dashboard container, leaving it in place for the next `up`.
    Stop {
        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
    /// Stops and removes the dashboard container.
    Down {
        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
}

fn find_recipe_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for name in RECIPE_FILE_NAMES.iter() {
            let recipe_file_path = path.join(name);
            if recipe_file_path.exists() {
                return Some(recipe_file_path);
            }
        }
    }

    None
}

fn load_recipe() -> Result<Recipe> {
    let current_dir = env::current_dir()?;
    let recipe_file_path = find_recipe_file(current_dir).ok_or_else(|| {
        anyhow!("Couldn't find a dashpack.yml file in the current working directory or any of its parents.")
    })?;
    info!("found recipe file {:?}", recipe_file_path);

    let work_directory = recipe_file_path
        .parent()
        .ok_or_else(|| anyhow!("Recipe file has no parent."))?;
    info!("found work directory {:?}", work_directory);

    let project_name = work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .ok_or_else(|| anyhow!("Couldn't determine the project name."))?;
    info!("project name {:?}", project_name);

    let recipe = YamlRecipeFrontend::new().recipe(project_name, &recipe_file_path)?;
    info!("parsed recipe");

    Ok(recipe)
}

fn parse_env(values: Vec<String>) -> Result<Map<String, String>> {
    let mut env = Map::new();

    for value in values {
        let (key, value) = split_value(&value);
        if !is_env_key(&key) {
            bail!("invalid environment variable name {:?}", key);
        }
        env.insert(key, value);
    }

    Ok(env)
}

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    if let Err(err) = run(opt) {
        let code = err
            .downcast_ref::<BuildError>()
            .map(BuildError::exit_code)
            .unwrap_or(1);

        if print_error(&mut stderr(), &err).is_err() {
            eprintln!("ERROR: {:#}", err);
        }

        process::exit(code);
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut stdout = stdout();

    let recipe = match opt.command {
        Command::Init => return init(&mut stdout),
        _ => load_recipe()?,
    };

    match opt.command {
        Command::Init => unreachable!(),
        Command::Render => {
            print!("{}", controller::plan(&recipe).render());
            return Ok(());
        }
        Command::Check => {
            controller::preflight(&recipe)?;
            print_info(
                &mut stdout,
                &format!(
                    "{} lists every required package ({}).\n",
                    recipe.manifest,
                    recipe.required_packages.0.join(", ")
                ),
            )?;
            return Ok(());
        }
        Command::Command => {
            let command = recipe.launch.startup_command(recipe.port);
            println!("{}", serde_json::to_string(&command)?);
            return Ok(());
        }
        _ => (),
    }

    let backend = CliBackend::connect(&opt.runtime)?;
    info!("connected to {:?}", opt.runtime);

    let mut controller = Controller::init(backend, recipe)?;
    info!("created controller");

    match opt.command {
        Command::Build { pull, force } => {
            let policy = if force {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            build(&mut controller, &mut stdout, policy, pull)?;
        }
        Command::Verify => {
            controller.verify_image()?;
            print_done(&mut stdout, "Verified required packages")?;
        }
        Command::Up {
            build: rebuild,
            port,
            host_port,
            env,
            timeout,
        } => {
            let policy = if rebuild {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            build(&mut controller, &mut stdout, policy, false)?;

            let options = LaunchOptions {
                port,
                host_port,
                env: parse_env(env)?,
            };
            let spec = controller.container_spec(&options)?;

            let diff = controller.start_containers_diff(&spec)?;
            container_apply(&mut controller, &mut stdout, diff, Some(&spec), timeout)?;

            if let Some(port) = spec.ports.first() {
                print_info(
                    &mut stdout,
                    &format!("dashboard published on http://localhost:{}\n", port.host),
                )?;
            }
        }
        Command::Stop { timeout } => {
            let diff = controller.stop_containers_diff()?;
            container_apply(&mut controller, &mut stdout, diff, None, timeout)?;
        }
        Command::Down { timeout } => {
            let diff = controller.remove_containers_diff()?;
            container_apply(&mut controller, &mut stdout, diff, None, timeout)?;
        }
        Command::Init | Command::Render | Command::Check | Command::Command => unreachable!(),
    }

    Ok(())
}

fn init(stdout: &mut impl Write) -> Result<()> {
    let path = env::current_dir()?.join(RECIPE_FILE_NAMES[0]);
    if path.exists() {
        bail!("{:?} already exists.", path);
    }

    fs::write(&path, default_recipe_file()?)?;
    print_done(stdout, &format!("Wrote {}", path.display()))
}

fn build(
    controller: &mut Controller,
    stdout: &mut impl Write,
    policy: BuildPolicy,
    pull: bool,
) -> Result<()> {
    let image_name = controller.recipe().image_name.clone();

    let report = controller.build_image(policy, pull, &mut |line: &str| println!("{}", line))?;

    match NumberPrefix::binary(report.context_size as f32) {
        NumberPrefix::Standalone(bytes) => println!("Archived build context ({} bytes)", bytes),
        NumberPrefix::Prefixed(prefix, n) => {
            println!("Archived build context ({:.1} {}B)", n, prefix)
        }
    };

    if report.rebuilt {
        print_done(
            stdout,
            &format!("Built {} ({})", image_name, report.image_id.0),
        )
    } else {
        print_info(stdout, &format!("{} is up to date.\n", image_name))
    }
}

fn print_info(stdout: &mut impl Write, message: &str) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
        .queue(style::Print(message))?
        .flush()?;

    Ok(())
}

fn print_done(stdout: &mut impl Write, message: &str) -> Result<()> {
    stdout
        .queue(style::Print(message))?
        .queue(style::Print(" ... "))?
        .queue(style::PrintStyledContent("done".green().bold()))?
        .queue(style::Print("\n"))?
        .flush()?;

    Ok(())
}

fn print_error(stderr: &mut impl Write, err: &anyhow::Error) -> Result<()> {
    stderr
        .queue(style::PrintStyledContent("ERROR: ".red().bold()))?
        .queue(style::Print(format!("{:#}\n", err)))?
        .flush()?;

    Ok(())
}

fn container_apply(
    controller: &mut Controller,
    stdout: &mut impl Write,
    operations: Vec<(ContainerName, ContainerOperation)>,
    spec: Option<&ContainerSpec>,
    timeout: u32,
) -> Result<()> {
    fn operation_verb(operation: ContainerOperation) -> &'static str {
        match operation {
            ContainerOperation::Create => "Creating",
            ContainerOperation::Recreate => "Recreating",
            ContainerOperation::Start => "Starting",
            ContainerOperation::Stop => "Stopping",
            ContainerOperation::Remove => "Removing",
        }
    }

    if operations.is_empty() {
        return print_info(stdout, "nothing to do.\n");
    }

    let lines = operations
        .iter()
        .map(|(container_name, operation)| {
            let verb = operation_verb(*operation);
            format!("{} {}", verb, container_name.0)
        })
        .collect::<Vec<_>>();

    let longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);

    for line in lines.iter() {
        stdout.queue(style::Print(line))?;

        let padding = longest_line - line.len() + 1;
        stdout
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::Print("...\n"))?;
    }

    stdout.flush()?;

    for (line, (container_name, operation)) in operations.into_iter().enumerate() {
        controller.container_apply(&container_name, operation, spec, timeout)?;

        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((lines.len() - line) as u16))?
            .queue(cursor::MoveRight(longest_line as u16 + 5))?
            .queue(style::PrintStyledContent("done".green().bold()))?
            .queue(cursor::RestorePosition)?
            .flush()?;
    }

    Ok(())
}
