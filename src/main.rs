use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use log::{error, info};
use thermal_printer_link::{AppState, BackendKind, PrinterConfig, PrinterEvent, logging};

const USAGE: &str = "usage: printer-link [--ble|--mock] <list | connect <address> | send <address> <file>>";

struct Cli {
    kind: BackendKind,
    command: Vec<String>,
}

fn parse_args() -> Cli {
    let mut kind = BackendKind::Platform;
    let mut command = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--ble" => kind = BackendKind::Ble,
            "--mock" => kind = BackendKind::Mock,
            _ => command.push(arg),
        }
    }
    Cli { kind, command }
}

async fn load_config() -> PrinterConfig {
    let loaded = match PrinterConfig::default_path() {
        Ok(path) => PrinterConfig::load_config(&path).await,
        Err(e) => Err(e),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("Falling back to default configuration: {}", e);
        PrinterConfig::default()
    })
}

async fn run(cli: Cli, config: PrinterConfig) -> Result<()> {
    let app_state = AppState::new(config, cli.kind).await?;
    let manager = app_state.get_printer_manager_arc();

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PrinterEvent::Disconnected { address } = &event {
                info!("Printer {} dropped the connection", address);
            }
        }
    });

    info!("Running on {}", manager.platform_version());

    let args: Vec<&str> = cli.command.iter().map(String::as_str).collect();
    let result: Result<()> = async {
        match args.as_slice() {
            ["list"] => {
                let devices = manager.bonded_devices().await?;
                println!("{}", serde_json::to_string_pretty(&devices)?);
            }
            ["connect", address] => {
                manager.connect(Some(*address)).await?;
                println!("Connected to {}", address);
            }
            ["send", address, file] => {
                let bytes = tokio::fs::read(PathBuf::from(*file))
                    .await
                    .with_context(|| format!("Failed to read {}", file))?;
                manager.connect(Some(*address)).await?;
                manager.write(&bytes).await?;
                println!("Sent {} bytes to {}", bytes.len(), address);
            }
            _ => bail!(USAGE),
        }
        Ok(())
    }
    .await;

    app_state.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = parse_args();
    let config = load_config().await;
    logging::init_logging(&config.log_level);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
