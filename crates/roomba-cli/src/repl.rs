//! REPL – interactive shell for driving the robot.
//!
//! Supported slash-commands:
//!   /drive <velocity> [radius]   – drive (radius omitted: straight)
//!   /direct <right> <left>       – per-wheel velocities (Create)
//!   /stop                        – stop the wheels
//!   /mode <mode> [maintain]      – change mode, optionally keep it
//!   /sensors [group]             – query a sensor group (default: all)
//!   /state                       – print the driver's robot state
//!   /leds <bits> <color> <level> – set the LEDs
//!   /song <n> <pitch:dur>...     – define and play a song
//!   /raw <json>                  – send any command as JSON
//!   /schema                      – print the command JSON schema
//!   /help, /quit | /exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use roomba_driver::RoombaDriver;
use roomba_types::{
    DRIVE_STRAIGHT_RADIUS, Note, Response, RoombaCommand, RoombaError, RoombaMode, SensorPacket,
};
use tokio::runtime::Runtime;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Issue(RoombaCommand),
    /// `None` queries the widest group the model supports.
    Sensors(Option<SensorPacket>),
    Mode { mode: RoombaMode, maintain: bool },
    Song { number: u8, notes: Vec<Note> },
    State,
    Schema,
    Help,
    Quit,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(driver: &RoombaDriver, rt: &Runtime, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "roomba>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse(input) {
            Ok(Action::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Action::Help) => cmd_help(),
            Ok(Action::State) => cmd_state(driver),
            Ok(Action::Schema) => cmd_schema(),
            Ok(Action::Issue(command)) => report(rt.block_on(driver.issue(command))),
            Ok(Action::Sensors(packet)) => {
                let packet =
                    packet.unwrap_or_else(|| SensorPacket::full_query(driver.config().model));
                report(rt.block_on(driver.issue(RoombaCommand::Sensors { packet })));
            }
            Ok(Action::Mode { mode, maintain }) => {
                report(rt.block_on(driver.set_mode(mode, maintain)));
            }
            Ok(Action::Song { number, notes }) => {
                let result = rt.block_on(async {
                    driver
                        .issue(RoombaCommand::DefineSong { number, notes })
                        .await?;
                    driver.issue(RoombaCommand::PlaySong { number }).await
                });
                report(result);
            }
            Err(msg) => {
                println!("{} {}", "Error:".red(), msg);
                println!("  Type {} for available commands.", "/help".bold());
            }
        }
    }
}

/// Turn one input line into an [`Action`].
pub fn parse(input: &str) -> Result<Action, String> {
    let mut words = input.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty input".to_string());
    };
    let args: Vec<&str> = words.collect();

    match cmd {
        "/help" => Ok(Action::Help),
        "/quit" | "/exit" => Ok(Action::Quit),
        "/state" => Ok(Action::State),
        "/schema" => Ok(Action::Schema),
        "/stop" => Ok(Action::Issue(RoombaCommand::stop())),
        "/drive" => {
            let velocity = arg(&args, 0, "velocity")?;
            let radius = match args.get(1) {
                None | Some(&"straight") => DRIVE_STRAIGHT_RADIUS,
                Some(_) => arg(&args, 1, "radius")?,
            };
            Ok(Action::Issue(RoombaCommand::Drive { velocity, radius }))
        }
        "/direct" => Ok(Action::Issue(RoombaCommand::DriveDirect {
            right: arg(&args, 0, "right velocity")?,
            left: arg(&args, 1, "left velocity")?,
        })),
        "/mode" => {
            let mode = args
                .first()
                .ok_or("usage: /mode <off|passive|safe|full> [maintain]")?
                .parse::<RoombaMode>()?;
            let maintain = match args.get(1) {
                None => false,
                Some(&"maintain") => true,
                Some(other) => return Err(format!("unexpected '{other}'")),
            };
            Ok(Action::Mode { mode, maintain })
        }
        "/sensors" => match args.first() {
            None | Some(&"all") => Ok(Action::Sensors(None)),
            Some(name) => sensor_group(name).map(|p| Action::Sensors(Some(p))),
        },
        "/leds" => Ok(Action::Issue(RoombaCommand::Leds {
            bits: arg(&args, 0, "bits")?,
            power_color: arg(&args, 1, "color")?,
            power_intensity: arg(&args, 2, "intensity")?,
        })),
        "/song" => {
            let number = arg(&args, 0, "song number")?;
            let notes = args[1..]
                .iter()
                .map(|spec| parse_note(spec))
                .collect::<Result<Vec<_>, _>>()?;
            if notes.is_empty() {
                return Err("usage: /song <number> <pitch:duration>...".to_string());
            }
            Ok(Action::Song { number, notes })
        }
        "/raw" => {
            let json = input.trim_start_matches("/raw").trim();
            serde_json::from_str::<RoombaCommand>(json)
                .map(Action::Issue)
                .map_err(|e| format!("not a command: {e}"))
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

fn arg<T: std::str::FromStr>(args: &[&str], ix: usize, name: &str) -> Result<T, String> {
    let raw = args.get(ix).ok_or_else(|| format!("missing {name}"))?;
    raw.parse::<T>()
        .map_err(|_| format!("'{raw}' is not a valid {name}"))
}

fn sensor_group(name: &str) -> Result<SensorPacket, String> {
    match name {
        "bumps" | "sensors" => Ok(SensorPacket::BumpsCliffsAndWalls),
        "pose" => Ok(SensorPacket::Pose),
        "power" => Ok(SensorPacket::Power),
        "cliff" => Ok(SensorPacket::CliffDetail),
        "telemetry" => Ok(SensorPacket::Telemetry),
        "roomba" => Ok(SensorPacket::AllRoomba),
        "create" => Ok(SensorPacket::AllCreate),
        other => Err(format!("unknown sensor group '{other}'")),
    }
}

fn parse_note(spec: &str) -> Result<Note, String> {
    let (pitch, duration) = spec
        .split_once(':')
        .ok_or_else(|| format!("note '{spec}' is not pitch:duration"))?;
    Ok(Note {
        pitch: pitch
            .parse()
            .map_err(|_| format!("'{pitch}' is not a valid pitch"))?,
        duration: duration
            .parse()
            .map_err(|_| format!("'{duration}' is not a valid duration"))?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn report(result: Result<Response, RoombaError>) {
    match result {
        Ok(response) => {
            let packet = serde_json::to_string(&response.packet)
                .unwrap_or_else(|e| format!("<unprintable: {e}>"));
            println!(
                "  {} [{}] {}",
                "✓".green().bold(),
                response.mode.to_string().yellow(),
                packet.dimmed()
            );
        }
        Err(e) => println!("  {} {}", "✗".red().bold(), e),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Roomba Commands".bold().underline());
    println!("  {}  – drive; radius omitted drives straight", "/drive <v> [r]".bold().cyan());
    println!("  {}  – per-wheel velocities (Create)", "/direct <r> <l>".bold().cyan());
    println!("  {}           – stop the wheels", "/stop".bold().cyan());
    println!("  {}  – off, passive, safe or full", "/mode <m> [maintain]".bold().cyan());
    println!("  {}  – bumps, pose, power, cliff, telemetry or all", "/sensors [group]".bold().cyan());
    println!("  {}          – current robot state", "/state".bold().cyan());
    println!("  {}  – advance/play bits, power color and level", "/leds <b> <c> <l>".bold().cyan());
    println!("  {}  – define and play a song", "/song <n> <p:d>...".bold().cyan());
    println!("  {}     – send a JSON command", "/raw <json>".bold().cyan());
    println!("  {}         – JSON schema for /raw", "/schema".bold().cyan());
    println!("  {}   – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_state(driver: &RoombaDriver) {
    match serde_json::to_string_pretty(&driver.state()) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_schema() {
    let schema = schemars::schema_for!(RoombaCommand);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}
