use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::vision::{self, EngineArgs, ServiceConfig, telemetry};

/// Fire and smoke detection service.
#[derive(Debug, Parser)]
#[command(name = "firewatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API with live camera and file processing.
    Serve {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Annotate one video file and print the session summary.
    Process {
        /// Input video path.
        video: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run detection on one image and print the prediction.
    Predict {
        /// Input image path.
        image: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

impl Cli {
    /// Build the engine configuration, install tracing and run the command.
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { engine } => with_config(engine, vision::run_server),
            Command::Process { video, engine } => {
                with_config(engine, |config| vision::run_process(config, &video))
            }
            Command::Predict { image, engine } => {
                with_config(engine, |config| vision::run_predict(config, &image))
            }
        }
    }
}

fn with_config(engine: EngineArgs, action: impl FnOnce(ServiceConfig) -> Result<()>) -> Result<()> {
    let config = ServiceConfig::try_from(engine)?;
    let _telemetry = telemetry::init(&config.telemetry, config.verbose);
    action(config)
}
