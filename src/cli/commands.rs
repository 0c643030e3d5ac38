use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::settings::{DeviceConfig, ParityConfig, Role, SessionStore, StopBitsConfig};
use crate::modbus::master::{Exchange, MasterOptions, ModbusMaster};
use crate::modbus::protocol::format_frame;
use crate::modbus::slave::{ModbusSlave, RegisterBank, ResponseMode};
use crate::modbus::transport::{enumerate_ports, SerialTransport};
use crate::output::{format_config_table, format_port_table, formatter_for};
use crate::utils::logging::DEFAULT_LOG_FILE;

/// Accepts decimal or `0x`-prefixed hex.
fn parse_u16(input: &str) -> Result<u16, String> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => input.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid 16-bit value '{}': {}", input, e))
}

fn config_type_arg() -> Arg {
    Arg::new("config_type")
        .required(true)
        .value_parser(["master", "slave"])
        .help("Which configuration to use: 'master' or 'slave'")
}

fn show_frames_arg() -> Arg {
    Arg::new("show-frames")
        .long("show-frames")
        .action(ArgAction::SetTrue)
        .help("Print the raw request and response frames")
}

fn timing_args() -> [Arg; 2] {
    [
        Arg::new("settle-ms")
            .long("settle-ms")
            .value_parser(value_parser!(u64))
            .default_value("100")
            .help("Delay between sending a request and reading the reply"),
        Arg::new("retries")
            .long("retries")
            .value_parser(value_parser!(u8))
            .default_value("0")
            .help("Extra attempts when the device stays silent or the reply is cut short"),
    ]
}

pub fn build_cli() -> Command {
    Command::new("modbus-utility")
        .version(crate::VERSION)
        .about("Modbus RTU master/slave utility for serial links")
        .arg(
            Arg::new("session-dir")
                .long("session-dir")
                .global(true)
                .default_value(".")
                .help("Directory holding the master/slave session files"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .global(true)
                .default_value(DEFAULT_LOG_FILE)
                .help("File the transaction log is appended to, '-' for stderr"),
        )
        .subcommand(
            Command::new("info")
                .about("General system information commands")
                .subcommand_required(true)
                .subcommand(Command::new("list-ports").about("List all available serial ports"))
                .subcommand(
                    Command::new("set-device")
                        .about("Select the Modbus configuration for master or slave operation")
                        .arg(Arg::new("port").required(true).help("Serial port, e.g. /dev/ttyUSB0"))
                        .arg(
                            Arg::new("address")
                                .required(true)
                                .value_parser(value_parser!(u8))
                                .help("Bus address of the slave device"),
                        )
                        .arg(config_type_arg())
                        .arg(
                            Arg::new("baudrate")
                                .long("baudrate")
                                .value_parser(value_parser!(u32))
                                .default_value("9600"),
                        )
                        .arg(Arg::new("parity").long("parity").default_value("N"))
                        .arg(
                            Arg::new("stopbits")
                                .long("stopbits")
                                .value_parser(value_parser!(u8))
                                .default_value("1"),
                        )
                        .arg(
                            Arg::new("timeout-ms")
                                .long("timeout-ms")
                                .value_parser(value_parser!(u64))
                                .default_value("1000"),
                        )
                        .arg(
                            Arg::new("no-check")
                                .long("no-check")
                                .action(ArgAction::SetTrue)
                                .help("Save without opening the port first"),
                        ),
                )
                .subcommand(
                    Command::new("show-config")
                        .about("Show the current device configuration")
                        .arg(config_type_arg()),
                ),
        )
        .subcommand(
            Command::new("master")
                .about("Modbus master operation")
                .subcommand_required(true)
                .subcommand(
                    Command::new("read-register")
                        .about("Read holding register(s) from the selected device")
                        .arg(
                            Arg::new("register")
                                .required(true)
                                .value_parser(parse_u16),
                        )
                        .arg(
                            Arg::new("num-registers")
                                .short('n')
                                .long("num-registers")
                                .value_parser(value_parser!(u16).range(1..=125))
                                .default_value("1"),
                        )
                        .arg(
                            Arg::new("format")
                                .long("format")
                                .value_parser(["table", "json", "csv"])
                                .default_value("table"),
                        )
                        .arg(
                            Arg::new("decimal")
                                .long("decimal")
                                .action(ArgAction::SetTrue)
                                .help("Show values in decimal instead of hex"),
                        )
                        .arg(show_frames_arg())
                        .args(timing_args()),
                )
                .subcommand(
                    Command::new("write-register")
                        .about("Write a value to a register of the selected device")
                        .arg(Arg::new("register").required(true).value_parser(parse_u16))
                        .arg(Arg::new("value").required(true).value_parser(parse_u16))
                        .arg(show_frames_arg())
                        .args(timing_args()),
                ),
        )
        .subcommand(
            Command::new("slave")
                .about("Modbus slave operation")
                .subcommand_required(true)
                .subcommand(
                    Command::new("run")
                        .about("Run the Modbus slave simulator")
                        .arg(
                            Arg::new("show-debug")
                                .long("show-debug")
                                .action(ArgAction::SetTrue)
                                .help("Log every received chunk"),
                        )
                        .arg(
                            Arg::new("fixture")
                                .long("fixture")
                                .action(ArgAction::SetTrue)
                                .help("Answer every read with the fixed test reply"),
                        )
                        .arg(
                            Arg::new("registers")
                                .long("registers")
                                .value_parser(value_parser!(usize))
                                .help("Number of registers exposed (default: full address space)"),
                        ),
                ),
        )
        .subcommand(Command::new("version").about("Show version information"))
}

fn session_store(matches: &ArgMatches) -> SessionStore {
    let dir = matches
        .get_one::<String>("session-dir")
        .map(String::as_str)
        .unwrap_or(".");
    SessionStore::new(dir)
}

/// Log destination chosen on the command line, `None` meaning stderr.
pub fn log_file(matches: &ArgMatches) -> Option<PathBuf> {
    match matches.get_one::<String>("log-file").map(String::as_str) {
        None | Some("-") => None,
        Some(path) => Some(PathBuf::from(path)),
    }
}

fn master_options(matches: &ArgMatches) -> MasterOptions {
    let defaults = MasterOptions::default();
    MasterOptions {
        settle: matches
            .get_one::<u64>("settle-ms")
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(defaults.settle),
        retries: matches.get_one::<u8>("retries").copied().unwrap_or(defaults.retries),
    }
}

fn required<'a, T: Clone + Send + Sync + 'static>(matches: &'a ArgMatches, id: &str) -> Result<&'a T> {
    matches
        .get_one::<T>(id)
        .ok_or_else(|| anyhow!("missing argument '{}'", id))
}

fn print_exchange(exchange: Option<&Exchange>) {
    if let Some(exchange) = exchange {
        println!("[!] Request frame: {}", format_frame(&exchange.request));
        println!("[!] Response frame: {}", format_frame(&exchange.response));
    }
}

/// Dispatches the parsed command line. Returns `Ok(false)` when no
/// subcommand was given.
pub async fn handle_subcommands(matches: &ArgMatches) -> Result<bool> {
    let store = session_store(matches);

    match matches.subcommand() {
        Some(("info", info_matches)) => handle_info(info_matches, &store)?,
        Some(("master", master_matches)) => handle_master(master_matches, &store)?,
        Some(("slave", slave_matches)) => handle_slave(slave_matches, &store).await?,
        Some(("version", _)) => {
            println!("Modbus Utility v{}", crate::VERSION);
            println!("Developed by EAT Team");
        }
        _ => return Ok(false),
    }

    Ok(true)
}

fn handle_info(matches: &ArgMatches, store: &SessionStore) -> Result<()> {
    match matches.subcommand() {
        Some(("list-ports", _)) => {
            let ports = enumerate_ports()?;
            if ports.is_empty() {
                println!("No serial ports found.");
            } else {
                println!("Available serial ports:");
                print!("{}", format_port_table(&ports));
            }
        }
        Some(("set-device", set_matches)) => {
            let role: Role = required::<String>(set_matches, "config_type")?.parse()?;
            let port = required::<String>(set_matches, "port")?;
            let address = *required::<u8>(set_matches, "address")?;

            let mut config = DeviceConfig::new(port.as_str(), address);
            config.baud_rate = *required::<u32>(set_matches, "baudrate")?;
            config.parity = required::<String>(set_matches, "parity")?.parse::<ParityConfig>()?;
            config.stop_bits = StopBitsConfig::try_from(*required::<u8>(set_matches, "stopbits")?)?;
            config.timeout_ms = *required::<u64>(set_matches, "timeout-ms")?;
            config.validate()?;

            if !set_matches.get_flag("no-check") {
                // fail early if the port cannot be opened with these settings
                SerialTransport::open(&config)?;
            }

            store.save(role, &config)?;
            println!("Selected device at address {} on port {}", config.address, config.port);
        }
        Some(("show-config", show_matches)) => {
            let role: Role = required::<String>(show_matches, "config_type")?.parse()?;
            let config = store.require(role)?;
            println!("Current {} device configuration:", role);
            print!("{}", format_config_table(&config));
        }
        _ => unreachable!("clap enforces a subcommand"),
    }
    Ok(())
}

fn handle_master(matches: &ArgMatches, store: &SessionStore) -> Result<()> {
    let config = store.require(Role::Master)?;

    match matches.subcommand() {
        Some(("read-register", read_matches)) => {
            let register = *required::<u16>(read_matches, "register")?;
            let count = *required::<u16>(read_matches, "num-registers")?;
            let format = required::<String>(read_matches, "format")?;
            let formatter = formatter_for(format, !read_matches.get_flag("decimal"))
                .ok_or_else(|| anyhow!("unknown output format '{}'", format))?;

            let mut master = ModbusMaster::open(&config, master_options(read_matches))?;
            let result = master.read_holding_registers(register, count);
            if read_matches.get_flag("show-frames") {
                print_exchange(master.last_exchange());
            }

            let values = result
                .with_context(|| format!("Failed to read register {}", register))?;
            let rendered = formatter.format(register, &values);
            if rendered.ends_with('\n') {
                print!("{}", rendered);
            } else {
                println!("{}", rendered);
            }
        }
        Some(("write-register", write_matches)) => {
            let register = *required::<u16>(write_matches, "register")?;
            let value = *required::<u16>(write_matches, "value")?;

            let mut master = ModbusMaster::open(&config, master_options(write_matches))?;
            let result = master.write_register(register, value);
            if write_matches.get_flag("show-frames") {
                print_exchange(master.last_exchange());
            }

            result.with_context(|| format!("Failed to write to register {}", register))?;
            println!("Wrote value {} to register {}", value, register);
        }
        _ => unreachable!("clap enforces a subcommand"),
    }
    Ok(())
}

async fn handle_slave(matches: &ArgMatches, store: &SessionStore) -> Result<()> {
    let Some(("run", run_matches)) = matches.subcommand() else {
        unreachable!("clap enforces a subcommand");
    };

    let config = store.require(Role::Slave)?;
    let mode = if run_matches.get_flag("fixture") {
        ResponseMode::Fixture
    } else {
        ResponseMode::Registers
    };

    let mut slave = ModbusSlave::open(&config, mode)?;
    if let Some(size) = run_matches.get_one::<usize>("registers") {
        slave = slave.with_bank(RegisterBank::new(*size));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let loop_stop = Arc::clone(&stop);
    let mut listener = tokio::task::spawn_blocking(move || slave.run(&loop_stop));

    println!("Listening for incoming data, to stop use ctrl + c");
    let stats = tokio::select! {
        finished = &mut listener => finished??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("Detected keyboard interrupt, exiting");
            stop.store(true, Ordering::Relaxed);
            listener.await??
        }
    };
    info!("Slave finished after replying to {} request(s)", stats.replied);
    Ok(())
}
