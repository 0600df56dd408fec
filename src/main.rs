use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ble_inspector_lib::commands::{self, Flow, HELP, OperatorCommand};
use ble_inspector_lib::config::{AdapterKind, InspectorConfig, config_path};
use ble_inspector_lib::core::SessionManager;
use ble_inspector_lib::core::bluetooth::{BleAdapter, BluestAdapter, SimulatedAdapter};
use ble_inspector_lib::display::EventPrinter;
use ble_inspector_lib::logging::ConsoleLogger;
use ble_inspector_lib::state::AppState;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEMO_NOTIFICATION_PERIOD: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Tokio runtime: {}", e))?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let config_path = config_path();
    let config = match InspectorConfig::load_config(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring unreadable config {:?}: {:#}", config_path, e);
            InspectorConfig::default()
        }
    };

    if ConsoleLogger::init(config.log_level_filter(), config.log_format).is_err() {
        // Only fall back to env_logger when the console logger could not be installed
        env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let cancel_token = CancellationToken::new();
    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
    let adapter: Arc<dyn BleAdapter> = match config.adapter {
        AdapterKind::Bluest => {
            info!("Initializing bluetooth adapter...");
            Arc::new(BluestAdapter::new(adapter_tx).await?)
        }
        AdapterKind::Simulated => {
            info!("Using the simulated adapter.");
            let simulated = Arc::new(SimulatedAdapter::demo(adapter_tx));
            let _ticker = simulated.start_notification_ticker(DEMO_NOTIFICATION_PERIOD, cancel_token.clone());
            simulated
        }
    };

    let (session_manager, event_rx) = SessionManager::start(adapter, adapter_rx, &config);
    let mut state = AppState::new(session_manager, config, config_path);
    let printer = EventPrinter::new(
        state.views_arc(),
        state.config.event_format,
        state.config.read_timeout(),
    );
    let printer_task = tokio::spawn(printer.run(event_rx));

    println!("BLE inspector ready. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted.");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("error: {}", e);
                if matches!(e, commands::CommandParseError::UnknownCommand(_)) {
                    println!("{}", HELP);
                }
                continue;
            }
        };
        match commands::execute(&mut state, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => println!("error: {:#}", e),
        }
    }

    state.into_session_manager().shutdown(SHUTDOWN_GRACE).await;
    cancel_token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, printer_task).await.is_err() {
        warn!("Event printer did not finish in time.");
    }
    Ok(())
}
