use serde::{Deserialize, Serialize};
use std::fmt;

pub const PORT_VARIABLE: &str = "PORT";
pub const BIND_ADDRESS: &str = "0.0.0.0";

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// An ASGI server process in front of an application callable.
    Asgi,
    /// The dashboard framework's own runner serving a script.
    Cli,
}

impl Default for LaunchMode {
    fn default() -> Self {
        LaunchMode::Asgi
    }
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMode::Asgi => "asgi",
            LaunchMode::Cli => "cli",
        }
    }

    /// Whether overriding `PORT` when the container starts moves the bind port.
    pub fn honors_port_override(self) -> bool {
        match self {
            LaunchMode::Asgi => true,
            LaunchMode::Cli => false,
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    pub mode: LaunchMode,
    /// `module:callable` handed to the ASGI server.
    pub target: String,
    /// Script path handed to the framework runner.
    pub script: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            mode: LaunchMode::Asgi,
            target: "src.main:app".into(),
            script: "src/main.py".into(),
        }
    }
}

/// The exact argv the container runs on start.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StartupCommand(pub Vec<String>);

impl StartupCommand {
    pub fn args(&self) -> &[String] {
        &self.0
    }
}

impl LaunchConfig {
    /// Renders the startup command for an image whose default port is `port`.
    ///
    /// The ASGI variant goes through a shell so `PORT` is read when the
    /// container starts. The runner variant bakes `port` into its flags.
    pub fn startup_command(&self, port: u16) -> StartupCommand {
        let args = match self.mode {
            LaunchMode::Asgi => vec![
                "sh".into(),
                "-c".into(),
                format!(
                    "exec uvicorn {} --host {} --port ${{{}}} --workers 1",
                    self.target, BIND_ADDRESS, PORT_VARIABLE
                ),
            ],
            LaunchMode::Cli => vec![
                "streamlit".into(),
                "run".into(),
                self.script.clone(),
                format!("--server.port={}", port),
                format!("--server.address={}", BIND_ADDRESS),
            ],
        };

        StartupCommand(args)
    }
}
