//! `mower-cli` – operator console for the mower control core
//!
//! This binary is the ignition switch for the stack. It:
//!
//! 1. Loads `~/.mower/config.toml`, running a **First-Run Wizard** when the
//!    file is absent. Configuration errors refuse startup.
//! 2. Boots [`MowerCore`] against simulated or configured hardware.
//! 3. Drops the operator into an **interactive console** with
//!    slash-commands (`/status`, `/drive`, `/mode`, `/jobs`, `/help`, ...).
//! 4. Intercepts **Ctrl-C** to engage the emergency stop and exit safely.
//!
//! `mower schema` prints the JSON Schema of the configuration file and
//! `mower check` validates it without booting.

mod config;
mod repl;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mower_hal::{DriverFactory, SimWorld};
use mower_runtime::{ControlApi, MowerCore};
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    // The OTLP exporter needs a runtime context when it is enabled.
    let _tracing = {
        let _enter = runtime.enter();
        mower_runtime::init_tracing("mower")
    };

    match std::env::args().nth(1).as_deref() {
        None => console(&runtime),
        Some("schema") => match config::schema() {
            Ok(schema) => {
                println!("{schema}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Schema error".red(), e);
                ExitCode::FAILURE
            }
        },
        Some("check") => match config::load() {
            Ok(Some(_)) => {
                println!("{} {}", "✓".green().bold(), config::config_path().display());
                ExitCode::SUCCESS
            }
            Ok(None) => {
                println!("No config at {}; defaults apply.", config::config_path().display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Config error".red(), e);
                ExitCode::FAILURE
            }
        },
        Some(other) => {
            eprintln!("Unknown argument '{other}'. Usage: mower [schema|check]");
            ExitCode::FAILURE
        }
    }
}

fn console(runtime: &Runtime) -> ExitCode {
    print_banner();

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
            println!("  Fix {} and try again.", config::config_path().display());
            return ExitCode::FAILURE;
        }
    };
    let core_config = match cfg.to_core_config() {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let factory = if cfg.core.simulation {
        DriverFactory::simulation(SimWorld::default())
    } else {
        DriverFactory::new()
    };

    println!();
    print!(
        "  {} ({} drivers, {} Hz{}) … ",
        "Booting control core".bold(),
        core_config.hardware.drivers.len(),
        core_config.control.fusion_hz,
        if cfg.core.simulation { ", simulation" } else { "" }
    );
    std::io::stdout().flush().ok();
    let core = match runtime.block_on(MowerCore::start(core_config, factory)) {
        Ok(core) => {
            println!("{}", "OK".green());
            core
        }
        Err(e) => {
            println!("{}: {}", "FAILED".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let api = core.api();
    info!(simulation = cfg.core.simulation, "mower core running");

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let handle = runtime.handle().clone();
    let ctrlc_api = api.clone();
    let ctrlc_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        emergency_stop(&handle, &ctrlc_api, "operator Ctrl-C");
        ctrlc_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; use /estop instead");
    }

    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );
    repl::run(runtime, &api, shutdown);

    print!("  Shutting down … ");
    std::io::stdout().flush().ok();
    runtime.block_on(core.shutdown());
    println!("{}", "OK".green());
    ExitCode::SUCCESS
}

/// Engage the emergency stop from outside the runtime.
pub(crate) fn emergency_stop(handle: &Handle, api: &ControlApi, reason: &str) {
    println!("{}", "⚠  Ctrl-C received – engaging emergency stop …".yellow().bold());
    match handle.block_on(api.emergency_stop(reason)) {
        Ok(()) => println!("{}", "  ✓ Emergency stop engaged.".green()),
        Err(e) => println!("  {}: {}", "Emergency stop failed".red().bold(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::MowerConfig {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().green());
    println!("{}", "  ║        Mower First-Run Wizard        ║".bold().green());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().green());
    println!();
    println!("  No configuration found.  Let's set up the mower.\n");

    let mut cfg = config::MowerConfig::default();

    let sim = prompt_line("  Run against simulated hardware? [Y/n]: ", "y");
    cfg.core.simulation = !matches!(sim.to_lowercase().as_str(), "n" | "no");

    let hz = prompt_line(
        &format!("  Fusion rate in Hz (1-10) [{}]: ", cfg.core.fusion_hz),
        &cfg.core.fusion_hz.to_string(),
    );
    match hz.parse::<u32>() {
        Ok(v) if (1..=10).contains(&v) => cfg.core.fusion_hz = v,
        _ => println!("  {} keeping {} Hz", "Warning:".yellow(), cfg.core.fusion_hz),
    }

    let dir = prompt_line("  Data directory (empty keeps everything in memory): ", "");
    if !dir.is_empty() {
        cfg.storage.data_dir = Some(dir.into());
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    if !cfg.core.simulation {
        println!(
            "  Add your [[hardware.drivers]] to the config before the next start.",
        );
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___                     "#.bold().green());
    println!("{}", r#"  /  |/  /__ _    _____ ____  "#.bold().green());
    println!("{}", r#" / /|_/ / _ \ |/|/ / -_) __/  "#.bold().green());
    println!("{}", r#"/_/  /_/\___/__,__/\__/_/     "#.bold().green());
    println!();
    println!(
        "  {} {}",
        "Mower".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Autonomous Lawn Mower Control Core");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::BufRead;
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
