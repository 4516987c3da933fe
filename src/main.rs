use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use robot_hw_runtime::config::Config;
use robot_hw_runtime::motor::Direction;
use robot_hw_runtime::runtime::{self, HardwareManager, IntegrationError, Link};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "robot-hw")]
#[command(about = "Hardware runtime for the wheeled robot base", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides config)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides config)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Use the simulated device instead of a serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run with safety monitoring until Ctrl-C
    Run,

    /// Print aggregated status and device telemetry
    Status,

    /// Move once with an expression, then stop
    Move {
        /// forward, backward, left, right or stop
        direction: Direction,

        /// Expression shown while moving
        #[arg(short, long, default_value = "curious")]
        expression: String,

        #[arg(short, long, default_value_t = 1000)]
        duration_ms: u64,

        /// Speed multiplier applied to the base speed
        #[arg(short, long, default_value_t = 1.0)]
        multiplier: f32,
    },

    /// Latch an emergency stop
    Estop,
}

fn load_config(cli: &Cli) -> Result<Config, BoxError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud = baud;
    }
    if cli.simulate {
        config.simulation = true;
    }
    config.validate()?;
    Ok(config)
}

async fn one_shot(config: Config, command: Commands) -> Result<(), BoxError> {
    let link = Link::from_config(&config);
    let mut manager = HardwareManager::new(config, link);
    manager.initialize().await?;

    let outcome: Result<(), BoxError> = async {
        match command {
            Commands::Status => {
                let device = manager.device_status().await?;
                println!("{}", serde_json::to_string_pretty(&manager.status())?);
                println!("{}", serde_json::to_string_pretty(&device)?);
            }
            Commands::Move {
                direction,
                expression,
                duration_ms,
                multiplier,
            } => {
                let speed = manager
                    .speed_for_multiplier(multiplier)
                    .ok_or(IntegrationError::NotOperational)?;
                let moved = manager
                    .move_with_expression_at(
                        direction,
                        &expression,
                        Duration::from_millis(duration_ms),
                        speed,
                    )
                    .await?;
                println!("moved: {}", moved);
            }
            Commands::Estop => {
                manager.emergency_stop().await?;
                println!("emergency stop latched");
            }
            Commands::Run => {}
        }
        Ok(())
    }
    .await;

    manager.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            None | Some(Commands::Run) => runtime::run(config).await,
            Some(command) => one_shot(config, command).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
