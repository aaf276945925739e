use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use face_attendance::config::AppConfig;
use face_attendance::credentials::Secrets;
use face_attendance::{serve, spreadsheet};

#[derive(Parser, Debug)]
#[command(author, version, about = "Face recognition attendance service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the attendance web page and API
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config file and PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write the blank attendance import template
    Template {
        /// Output .xlsx file
        #[arg(short, long, default_value = "attendance_template.xlsx")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config, port } => run_serve(config, port),
        Command::Template { output } => write_template(output),
    }
}

fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &config_path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    config.apply_env()?;
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;

    if let Some(path) = &config_path {
        info!("Loaded config from {}", path.display());
    }

    let secrets = Secrets::from_env()?;
    serve::run_server(config, secrets)
}

fn write_template(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = spreadsheet::template_table()?;
    std::fs::write(&output, bytes)
        .map_err(|e| format!("Failed to write template '{}': {}", output.display(), e))?;
    println!("Template written to {}", output.display());
    Ok(())
}
