//! Console commands
//! This module parses the operator's input lines and runs them against the session.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::constants::{describe_uuid, parse_uuid};
use crate::core::bluetooth::{BluetoothDevice, DeviceFilter, WriteMode};
use crate::state::AppState;
use crate::utils::{format_hex, try_decode_text};

pub const HELP: &str = "\
Commands:
  scan [ms]                         scan for devices (default from config)
  devices [mac=..] [rssi=..] [adv=..]
                                    list devices seen by the last scan
  show <addr>                       advertisement details of a device
  connect <addr>                    open a device view and connect
  disconnect <addr>                 disconnect, keeping the view
  close <addr>                      disconnect and close the view
  services <addr>                   print the discovered GATT tree
  read <addr> <char>                read a characteristic
  write <addr> <char> <hex>         write bytes, e.g. `01 ff` or `01ff`
  notify <addr> <char>              toggle notifications
  status                            list sessions and open views
  set scan|timeout <seconds>        change scan time or connect timeout (1-60 s)
  help                              show this text
  quit                              disconnect everything and exit
Characteristics accept a full UUID or a 16-bit short form such as 2a19.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}`, try `help`")]
    UnknownCommand(String),
    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("unexpected argument `{0}`")]
    UnexpectedArgument(String),
    #[error("`{0}` is not a characteristic UUID")]
    InvalidCharacteristic(String),
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
    #[error("`{0}` is not a number")]
    InvalidNumber(String),
    #[error("unknown filter `{0}`, expected mac=, rssi= or adv=")]
    UnknownFilter(String),
    #[error("unknown setting `{0}`, expected scan or timeout")]
    UnknownSetting(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    ScanSeconds(u64),
    TimeoutSeconds(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Scan { duration: Option<Duration> },
    Devices(DeviceFilter),
    Show { address: String },
    Connect { address: String },
    Disconnect { address: String },
    Close { address: String },
    Services { address: String },
    Read { address: String, characteristic: Uuid },
    Write { address: String, characteristic: Uuid, value: Vec<u8> },
    Notify { address: String, characteristic: Uuid },
    Status,
    Set(Setting),
    Help,
    Quit,
}

/// Whether the console keeps reading input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

struct Arguments<'a> {
    command: &'static str,
    words: std::str::SplitWhitespace<'a>,
}

impl<'a> Arguments<'a> {
    fn required(&mut self, argument: &'static str) -> Result<&'a str, CommandParseError> {
        self.words.next().ok_or(CommandParseError::MissingArgument {
            command: self.command,
            argument,
        })
    }

    fn address(&mut self) -> Result<String, CommandParseError> {
        self.required("a device address").map(normalize_address)
    }

    fn characteristic(&mut self) -> Result<Uuid, CommandParseError> {
        let text = self.required("a characteristic")?;
        parse_uuid(text).ok_or_else(|| CommandParseError::InvalidCharacteristic(text.to_string()))
    }

    fn rest(&mut self) -> Vec<&'a str> {
        self.words.by_ref().collect()
    }

    fn finish<T>(mut self, value: T) -> Result<T, CommandParseError> {
        match self.words.next() {
            Some(extra) => Err(CommandParseError::UnexpectedArgument(extra.to_string())),
            None => Ok(value),
        }
    }
}

impl FromStr for OperatorCommand {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandParseError::Empty)?.to_lowercase();
        let command: &'static str = match verb.as_str() {
            "scan" => "scan",
            "devices" => "devices",
            "show" => "show",
            "connect" => "connect",
            "disconnect" => "disconnect",
            "close" => "close",
            "services" => "services",
            "read" => "read",
            "write" => "write",
            "notify" => "notify",
            "status" => "status",
            "set" => "set",
            "help" | "?" => "help",
            "quit" | "exit" => "quit",
            _ => return Err(CommandParseError::UnknownCommand(verb)),
        };
        let mut args = Arguments { command, words };

        match command {
            "scan" => {
                let duration = match args.words.next() {
                    Some(ms) => Some(Duration::from_millis(parse_number(ms)?)),
                    None => None,
                };
                args.finish(Self::Scan { duration })
            }
            "devices" => {
                let filter = parse_filter(&args.rest())?;
                Ok(Self::Devices(filter))
            }
            "show" => {
                let address = args.address()?;
                args.finish(Self::Show { address })
            }
            "connect" => {
                let address = args.address()?;
                args.finish(Self::Connect { address })
            }
            "disconnect" => {
                let address = args.address()?;
                args.finish(Self::Disconnect { address })
            }
            "close" => {
                let address = args.address()?;
                args.finish(Self::Close { address })
            }
            "services" => {
                let address = args.address()?;
                args.finish(Self::Services { address })
            }
            "read" => {
                let address = args.address()?;
                let characteristic = args.characteristic()?;
                args.finish(Self::Read {
                    address,
                    characteristic,
                })
            }
            "write" => {
                let address = args.address()?;
                let characteristic = args.characteristic()?;
                let value = parse_hex_payload(&args.rest().join(" "))?;
                Ok(Self::Write {
                    address,
                    characteristic,
                    value,
                })
            }
            "notify" => {
                let address = args.address()?;
                let characteristic = args.characteristic()?;
                args.finish(Self::Notify {
                    address,
                    characteristic,
                })
            }
            "set" => {
                let name = args.required("scan or timeout")?.to_lowercase();
                let seconds = parse_number(args.required("a number of seconds")?)?;
                let setting = match name.as_str() {
                    "scan" => Setting::ScanSeconds(seconds),
                    "timeout" => Setting::TimeoutSeconds(seconds),
                    _ => return Err(CommandParseError::UnknownSetting(name)),
                };
                args.finish(Self::Set(setting))
            }
            "status" => args.finish(Self::Status),
            "help" => args.finish(Self::Help),
            _ => args.finish(Self::Quit),
        }
    }
}

fn normalize_address(text: &str) -> String {
    text.to_uppercase()
}

fn parse_number(text: &str) -> Result<u64, CommandParseError> {
    text.parse()
        .map_err(|_| CommandParseError::InvalidNumber(text.to_string()))
}

fn parse_filter(words: &[&str]) -> Result<DeviceFilter, CommandParseError> {
    let mut filter = DeviceFilter::default();
    for word in words {
        match word.split_once('=') {
            Some(("mac", value)) => filter.mac = Some(value.to_string()),
            Some(("rssi", value)) => {
                let rssi = value
                    .parse()
                    .map_err(|_| CommandParseError::InvalidNumber(value.to_string()))?;
                filter.min_rssi = Some(rssi);
            }
            Some(("adv", value)) => filter.adv_hex = Some(value.to_lowercase()),
            _ => return Err(CommandParseError::UnknownFilter(word.to_string())),
        }
    }
    Ok(filter)
}

/// Parses `01 ff 10`, `01ff10` or `0x01 0xff`. Empty input is rejected.
pub fn parse_hex_payload(text: &str) -> Result<Vec<u8>, CommandParseError> {
    let digits: String = text
        .split_whitespace()
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect();
    if digits.is_empty() {
        return Err(CommandParseError::InvalidHex("nothing to write".to_string()));
    }
    hex::decode(&digits).map_err(|e| CommandParseError::InvalidHex(e.to_string()))
}

/// `Battery Level (00002a19-...)`, or the bare UUID when it has no known name
pub fn uuid_label(uuid: &Uuid) -> String {
    match describe_uuid(uuid) {
        Some(name) => format!("{} ({})", name, uuid),
        None => uuid.to_string(),
    }
}

/// Hex plus the decoded text when the value is printable
pub fn format_value(value: &[u8]) -> String {
    match try_decode_text(value) {
        Some(text) => format!("{} \"{}\"", format_hex(value), text),
        None => format_hex(value),
    }
}

fn require_view(state: &AppState, address: &str) -> Result<()> {
    if !state.views().is_open(address) {
        anyhow::bail!("no open view for {}, use `connect {}` first", address, address);
    }
    Ok(())
}

fn print_devices(devices: &[BluetoothDevice], state: &AppState) {
    if devices.is_empty() {
        println!("No devices.");
        return;
    }
    println!("{:<40} {:>5} {:>8}  {:<24} manufacturer", "address", "rssi", "period", "name");
    for device in devices {
        let rssi = device
            .rssi
            .map(|rssi| rssi.to_string())
            .unwrap_or_else(|| "-".to_string());
        let period = state
            .session_manager
            .min_period(&device.address)
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:>5} {:>8}  {:<24} {}",
            device.address,
            rssi,
            period,
            device.display_name(),
            device.advertisement.manufacturer_hex()
        );
    }
}

fn print_device(device: &BluetoothDevice, min_period: Option<u64>) {
    let adv = &device.advertisement;
    println!("{} ({})", device.address, device.display_name());
    println!("  platform id:   {}", device.id);
    if let Some(rssi) = device.rssi {
        println!("  rssi:          {} dBm", rssi);
    }
    if let Some(tx_power) = adv.tx_power {
        println!("  tx power:      {} dBm", tx_power);
    }
    match min_period {
        Some(ms) => println!("  min period:    {} ms", ms),
        None => println!("  min period:    -"),
    }
    for (company_id, data) in &adv.manufacturer_data {
        println!("  manufacturer:  0x{:04x} {}", company_id, format_hex(data));
    }
    for uuid in &adv.service_uuids {
        println!("  service:       {}", uuid_label(uuid));
    }
    for (uuid, data) in &adv.service_data {
        println!("  service data:  {} {}", uuid_label(uuid), format_hex(data));
    }
}

fn print_services(state: &AppState, address: &str) -> Result<()> {
    let record = state
        .session_manager
        .snapshot(address)
        .ok_or_else(|| anyhow::anyhow!("no session for {}", address))?;
    let Some(services) = record.services else {
        println!("{} has no discovered services ({})", address, record.state);
        return Ok(());
    };
    println!("{} ({})", address, record.state);
    for service in services.services() {
        println!("  {}", uuid_label(&service.uuid));
        for characteristic in &service.characteristics {
            let marker = if record.subscriptions.contains(&characteristic.uuid) {
                " *notifying*"
            } else {
                ""
            };
            println!(
                "    {} [{}]{}",
                uuid_label(&characteristic.uuid),
                characteristic.properties,
                marker
            );
        }
    }
    Ok(())
}

fn print_status(state: &AppState) {
    let records = state.session_manager.registry().snapshots();
    if records.is_empty() {
        println!("No sessions.");
    }
    for record in records {
        let client = record
            .client
            .map(|client| client.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<13} {:<10} {} subscription(s)",
            record.address,
            record.state.to_string(),
            client,
            record.subscriptions.len()
        );
    }
    let views = state.views().addresses();
    if !views.is_empty() {
        println!("Open views: {}", views.join(", "));
    }
}

/// The acknowledgement mode of a write follows the characteristic's `write`
/// property. Unknown characteristics get acknowledged writes.
fn write_mode(state: &AppState, address: &str, characteristic: &Uuid) -> WriteMode {
    state
        .session_manager
        .snapshot(address)
        .and_then(|record| record.services)
        .and_then(|services| {
            services
                .characteristic(characteristic)
                .map(|c| c.properties.write_mode())
        })
        .unwrap_or(WriteMode::WithResponse)
}

/// Runs one operator command. Session operations are only queued here;
/// their outcome arrives later as events.
pub async fn execute(state: &mut AppState, command: OperatorCommand) -> Result<Flow> {
    let commands = state.session_manager.commands();
    match command {
        OperatorCommand::Scan { duration } => {
            let duration = duration.unwrap_or_else(|| state.config.scan_duration());
            commands.scan(duration)?;
        }
        OperatorCommand::Devices(filter) => {
            let devices = state.session_manager.devices(&filter);
            print_devices(&devices, state);
        }
        OperatorCommand::Show { address } => match state.session_manager.device(&address) {
            Some(device) => print_device(&device, state.session_manager.min_period(&address)),
            None => anyhow::bail!("{} was not seen by the last scan", address),
        },
        OperatorCommand::Connect { address } => {
            if !state.views().open(&address) {
                info!("View for {} already open, reconnecting", address);
            }
            commands.connect(&address, state.config.connection_timeout())?;
        }
        OperatorCommand::Disconnect { address } => {
            require_view(state, &address)?;
            commands.disconnect(&address)?;
        }
        OperatorCommand::Close { address } => {
            state.session_manager.close(&address)?;
            if !state.views().close(&address) {
                warn!("No open view for {}", address);
            }
        }
        OperatorCommand::Services { address } => {
            require_view(state, &address)?;
            print_services(state, &address)?;
        }
        OperatorCommand::Read {
            address,
            characteristic,
        } => {
            require_view(state, &address)?;
            commands.read(&address, characteristic)?;
            state.views().read_started(&address, characteristic);
        }
        OperatorCommand::Write {
            address,
            characteristic,
            value,
        } => {
            require_view(state, &address)?;
            let mode = write_mode(state, &address, &characteristic);
            commands.write(&address, characteristic, value, mode)?;
        }
        OperatorCommand::Notify {
            address,
            characteristic,
        } => {
            require_view(state, &address)?;
            let registry = state.session_manager.registry();
            if registry.is_subscribed(&address, &characteristic) {
                println!("Stopping notifications of {}", uuid_label(&characteristic));
                commands.stop_notify(&address, characteristic)?;
            } else {
                println!("Starting notifications of {}", uuid_label(&characteristic));
                commands.start_notify(&address, characteristic)?;
            }
        }
        OperatorCommand::Status => print_status(state),
        OperatorCommand::Set(setting) => {
            match setting {
                Setting::ScanSeconds(seconds) => state.config.set_scan_duration_secs(seconds)?,
                Setting::TimeoutSeconds(seconds) => {
                    state.config.set_connection_timeout_secs(seconds)?
                }
            }
            println!(
                "Scan time {} s, connection timeout {} s",
                state.config.scan_duration().as_secs(),
                state.config.connection_timeout().as_secs()
            );
            if let Err(e) = state.config.save_config(&state.config_path).await {
                warn!("Settings apply to this run only, saving failed: {:#}", e);
            }
        }
        OperatorCommand::Help => println!("{}", HELP),
        OperatorCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_BATTERY_LEVEL;

    #[test]
    fn parses_short_and_full_characteristic_ids() {
        let short: OperatorCommand = "read aa:bb:cc:dd:ee:ff 2a19".parse().unwrap();
        let full: OperatorCommand = "read AA:BB:CC:DD:EE:FF 00002a19-0000-1000-8000-00805f9b34fb"
            .parse()
            .unwrap();
        let expected = OperatorCommand::Read {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            characteristic: UUID_BATTERY_LEVEL,
        };
        assert_eq!(short, expected);
        assert_eq!(full, expected);
    }

    #[test]
    fn write_accepts_spaced_and_contiguous_hex() {
        let spaced: OperatorCommand = "write AA 0x2a19 01 ff 10".parse().unwrap();
        let contiguous: OperatorCommand = "write AA 2a19 01ff10".parse().unwrap();
        assert_eq!(spaced, contiguous);
        assert!(matches!(
            spaced,
            OperatorCommand::Write { ref value, .. } if value == &vec![0x01, 0xff, 0x10]
        ));
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        assert!(matches!(
            "write AA 2a19".parse::<OperatorCommand>(),
            Err(CommandParseError::InvalidHex(_))
        ));
        assert!(matches!(
            "write AA 2a19 0g".parse::<OperatorCommand>(),
            Err(CommandParseError::InvalidHex(_))
        ));
        assert!(matches!(
            "write AA 2a19 123".parse::<OperatorCommand>(),
            Err(CommandParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn device_filters_parse() {
        let command: OperatorCommand = "devices mac=ee:ff rssi=-70 adv=4C00".parse().unwrap();
        assert_eq!(
            command,
            OperatorCommand::Devices(DeviceFilter {
                mac: Some("ee:ff".to_string()),
                min_rssi: Some(-70),
                adv_hex: Some("4c00".to_string()),
            })
        );
        assert_eq!(
            "devices color=red".parse::<OperatorCommand>(),
            Err(CommandParseError::UnknownFilter("color=red".to_string()))
        );
    }

    #[test]
    fn parse_errors_name_the_problem() {
        assert_eq!("".parse::<OperatorCommand>(), Err(CommandParseError::Empty));
        assert_eq!(
            "frobnicate".parse::<OperatorCommand>(),
            Err(CommandParseError::UnknownCommand("frobnicate".to_string()))
        );
        assert_eq!(
            "connect".parse::<OperatorCommand>(),
            Err(CommandParseError::MissingArgument {
                command: "connect",
                argument: "a device address",
            })
        );
        assert_eq!(
            "status now".parse::<OperatorCommand>(),
            Err(CommandParseError::UnexpectedArgument("now".to_string()))
        );
        assert_eq!(
            "read AA battery".parse::<OperatorCommand>(),
            Err(CommandParseError::InvalidCharacteristic("battery".to_string()))
        );
    }

    #[test]
    fn settings_and_scan_arguments_parse() {
        assert_eq!(
            "set scan 12".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Set(Setting::ScanSeconds(12)))
        );
        assert_eq!(
            "set timeout 3".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Set(Setting::TimeoutSeconds(3)))
        );
        assert_eq!(
            "set volume 3".parse::<OperatorCommand>(),
            Err(CommandParseError::UnknownSetting("volume".to_string()))
        );
        assert_eq!(
            "scan 1500".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Scan {
                duration: Some(Duration::from_millis(1500))
            })
        );
    }

    #[test]
    fn values_show_text_when_printable() {
        assert_eq!(format_value(b"ENV-2"), "45 4E 56 2D 32 \"ENV-2\"");
        assert_eq!(format_value(&[0x00, 0x48]), "00 48");
    }
}
