//! `roomba-cli` – interactive console for a Roomba or Create.
//!
//! This binary:
//!
//! 1. Loads `~/.roomba/config.toml`; runs a short first-run wizard when the
//!    file is absent.
//! 2. Connects to a simulated robot, a serial-over-TCP bridge or a local
//!    serial port.
//! 3. Prints change notifications as they arrive.
//! 4. Drops the user into a REPL with slash-commands (`/drive`, `/mode`,
//!    `/sensors`, `/state`, `/help`, ...).
//! 5. Intercepts **Ctrl-C** to stop the wheels and close the link.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use config::{Config, LinkKind};
use roomba_driver::RoombaDriver;
use roomba_link::{SerialPortTransport, SerialTransport, SimulatedRobot, TcpTransport};
use roomba_types::{Notification, NotificationPayload, RobotModel, RoombaCommand};

fn main() {
    let _telemetry = telemetry::init_tracing("roomba");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };

    // ── Connect ───────────────────────────────────────────────────────────
    print!(
        "\n  Connecting to {} {} over {} … ",
        cfg.driver.model.to_string().bold(),
        cfg.driver.port.dimmed(),
        cfg.link.to_string().bold()
    );
    std::io::Write::flush(&mut std::io::stdout()).ok();

    let transport = build_transport(&cfg);
    let driver = match rt.block_on(RoombaDriver::connect(cfg.driver.clone(), transport)) {
        Ok(driver) => {
            println!("{} (mode {})", "connected".green(), driver.state().mode.to_string().yellow());
            driver
        }
        Err(e) => {
            println!("{}", "failed".red());
            println!("  {}", e);
            std::process::exit(1);
        }
    };

    if cfg.print_notifications {
        let mut notifications = driver.subscribe(cfg.notify.iter().copied());
        rt.spawn(async move {
            while let Some(n) = notifications.recv().await {
                print_notification(&n);
            }
        });
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let driver_ctrlc = driver.clone();
    let handle = rt.handle().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the robot …".yellow().bold());
        handle.block_on(async {
            if let Err(e) = driver_ctrlc.issue(RoombaCommand::stop()).await {
                warn!(error = %e, "stop command failed");
            }
            driver_ctrlc.close().await;
        });
        println!("{}", "  ✓ Wheels stopped, link closed.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
        // The REPL is blocked on stdin; spans are exported synchronously,
        // so nothing is lost by leaving here.
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the robot will not be stopped on Ctrl-C");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&driver, &rt, shutdown);

    rt.block_on(async {
        let _ = driver.issue(RoombaCommand::stop()).await;
        driver.close().await;
    });
}

fn build_transport(cfg: &Config) -> Box<dyn SerialTransport> {
    match cfg.link {
        LinkKind::Simulated => Box::new(SimulatedRobot::new(cfg.driver.model).with_boot_banner()),
        LinkKind::Tcp => Box::new(TcpTransport::new(cfg.driver.port.clone())),
        LinkKind::Serial => Box::new(SerialPortTransport::new(
            cfg.driver.port.clone(),
            cfg.driver.baud_rate,
        )),
    }
}

fn print_notification(n: &Notification) {
    let at = n
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S%.3f");
    let detail = match &n.payload {
        NotificationPayload::Mode {
            mode,
            maintain_mode,
        } => match maintain_mode {
            Some(m) => format!("{mode} (maintaining {m})"),
            None => mode.to_string(),
        },
        NotificationPayload::Pose(p) => format!(
            "distance {} mm, angle {}°",
            p.distance_total_mm, p.angle_total_deg
        ),
        NotificationPayload::Power(p) => match p.charge_percent() {
            Some(pct) => format!("{} mV, {} mA, {pct}%", p.voltage_mv(), p.current_ma()),
            None => format!("{} mV, {} mA", p.voltage_mv(), p.current_ma()),
        },
        NotificationPayload::BumpsCliffsAndWalls(s) => format!(
            "bump L/R {}/{}, wall {}, wheel drop {}",
            s.bump_left(),
            s.bump_right(),
            s.wall(),
            s.wheel_dropped()
        ),
        NotificationPayload::CliffDetail(c) => format!("cliff signals {:?}", c.cliff_signals()),
        NotificationPayload::Telemetry(t) => format!(
            "velocity {} mm/s, radius {} mm",
            t.requested_velocity(),
            t.requested_radius()
        ),
    };
    println!(
        "\n  {} {} {}",
        at.to_string().dimmed(),
        format!("{:?}", n.category()).cyan(),
        detail
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Roomba First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the link.\n");

    let mut cfg = Config::default();

    println!("  Which robot?");
    println!("    1) iRobot Create  (default)");
    println!("    2) iRobot Roomba");
    if prompt_line("  Enter choice [1]: ", "1").trim() == "2" {
        cfg.driver.model = RobotModel::Roomba;
        cfg.driver.connection = roomba_types::ConnectionKind::RoombaSerial;
    }

    println!("  How is it connected?");
    println!("    1) Simulated robot  (default)");
    println!("    2) Serial-over-TCP bridge");
    println!("    3) Local serial port");
    cfg.link = match prompt_line("  Enter choice [1]: ", "1").trim() {
        "2" => LinkKind::Tcp,
        "3" => LinkKind::Serial,
        _ => LinkKind::Simulated,
    };

    if cfg.link != LinkKind::Simulated {
        let default_port = match cfg.link {
            LinkKind::Tcp => "192.168.1.20:2000".to_string(),
            _ => cfg.driver.port.clone(),
        };
        cfg.driver.port = prompt_line(&format!("  Port [{default_port}]: "), &default_port);
    }

    config::apply_env_overrides(&mut cfg);
    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___                 __         "#.bold().cyan());
    println!("{}", r#"  / _ \___  ___  __ _ / /  ___ _  "#.bold().cyan());
    println!("{}", r#" / , _/ _ \/ _ \/  ' \/ _ \/ _ `/ "#.bold().cyan());
    println!("{}", r#"/_/|_|\___/\___/_/_/_/_.__/\_,_/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "roomba".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Open Interface console for the iRobot Roomba and Create");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
