use std::path::PathBuf;

use clap::Parser;

use nvlist_debug_relay::{config, RelayConfig, SessionConfig};

/// Debug adapter for NVList projects, speaking the protocol on stdin/stdout
#[derive(Debug, Parser)]
#[command(name = "nvlist-debug-relay", version)]
struct Args {
    /// Project root folder
    #[arg(long)]
    project_folder: PathBuf,

    /// Folder with the build-tool wrapper (defaults to <project>/build-tools)
    #[arg(long)]
    build_tools_folder: Option<PathBuf>,

    /// Alternate Java home used to run the build
    #[arg(long)]
    runtime_home: Option<PathBuf>,

    /// Port of the runtime's debug server
    #[arg(long)]
    port: Option<u16>,

    /// Script being debugged
    #[arg(long)]
    program: Option<PathBuf>,

    /// Relay settings file (defaults to the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::for_project(&self.project_folder);
        if let Some(folder) = &self.build_tools_folder {
            session.build_tools_folder = folder.clone();
        }
        session.runtime_home = self.runtime_home.clone();
        session.port = self.port;
        session.program = self.program.clone();
        session
    }

    fn relay_config(&self) -> nvlist_debug_relay::Result<RelayConfig> {
        match &self.config {
            Some(path) => config::read_relay_config_from_path(path),
            None => config::read_relay_config(),
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    nvlist_debug_relay::init_tracing();

    let args = Args::parse();
    let relay_config = match args.relay_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    match nvlist_debug_relay::run(args.session_config(), relay_config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Debug relay stopped: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
