use std::path::PathBuf;

use clap::Parser;

use crate::config::AppConfig;

/// Command line of the manager. Flags given here win over the config file
/// and over `--set` overrides.
#[derive(Parser, Debug, Default)]
#[command(
    name = "ds_manager",
    about = "Dataswarm manager: coordinates workers and clients over persistent TCP connections",
    disable_version_flag = true
)]
pub struct Cli {
    /// Project this manager serves
    #[arg(short = 'N', long = "name", value_name = "PROJECT")]
    pub name: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Enable debug output for a subsystem, or `all`
    #[arg(short, long = "debug", value_name = "SUBSYSTEM")]
    pub debug: Vec<String>,

    /// Write log lines to this file instead of stdout
    #[arg(short = 'o', long = "debug-file", value_name = "PATH")]
    pub debug_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override one setting, e.g. `--set manager.file_quorum=2`
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

impl Cli {
    /// Layers the flags onto an already loaded configuration.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(name) = &self.name {
            config.manager.project_name = name.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if !self.debug.is_empty() {
            config.logging.level = "debug".to_owned();
            config.logging.debug_subsystems = self.debug.clone();
        }
        if let Some(path) = &self.debug_file {
            config.logging.file = path.to_string_lossy().into_owned();
        }
    }
}

pub fn version_line() -> String {
    format!(
        "{} version {} (built {}, revision {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("DATASWARM_BUILD_DATE_UTC"),
        env!("DATASWARM_GIT_REVISION")
    )
}
