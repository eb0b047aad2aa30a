//! REPL – operator console for a running mower core.
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /status                    – fused state, interlocks, job and forecast
//!   /drive <linear> <angular>  – manual drive (m/s, rad/s)
//!   /blade on|off              – blade motor
//!   /stop                      – stop all motors
//!   /mode <mode>               – idle, manual or autonomous
//!   /estop [reason]            – operator emergency stop
//!   /reset                     – leave emergency stop once interlocks clear
//!   /ack <interlock>           – acknowledge a cleared interlock
//!   /geofence                  – show the active geofence
//!   /jobs                      – list jobs
//!   /job add <name> <cron>     – create a job (five cron fields)
//!   /job start|cancel|rm <id>  – run now, cancel or delete a job
//!   /drivers                   – driver registry and health
//!   /bundle [note]             – capture a diagnostics bundle
//!   /bundles                   – list archived bundles
//!   /quit | /exit              – stop the core and exit

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mower_runtime::{ApiError, ControlApi, StatusReport};
use mower_types::JobSpec;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Drive { linear_mps: f32, angular_rps: f32 },
    Blade(bool),
    Stop,
    Mode(String),
    EmergencyStop(String),
    Reset,
    Ack(String),
    Geofence,
    Jobs,
    JobAdd { name: String, schedule: String },
    JobStart(Uuid),
    JobCancel(Uuid),
    JobRemove(Uuid),
    Drivers,
    Bundle(String),
    Bundles,
    Quit,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or("empty command")?;
    let rest: Vec<&str> = words.collect();

    let cmd = match head {
        "/help" => Command::Help,
        "/status" => Command::Status,
        "/drive" => match rest.as_slice() {
            [linear, angular] => Command::Drive {
                linear_mps: parse_number(linear)?,
                angular_rps: parse_number(angular)?,
            },
            _ => return Err("usage: /drive <linear m/s> <angular rad/s>".to_string()),
        },
        "/blade" => match rest.as_slice() {
            ["on"] => Command::Blade(true),
            ["off"] => Command::Blade(false),
            _ => return Err("usage: /blade on|off".to_string()),
        },
        "/stop" => Command::Stop,
        "/mode" => match rest.as_slice() {
            [mode] => Command::Mode(mode.to_string()),
            _ => return Err("usage: /mode idle|manual|autonomous".to_string()),
        },
        "/estop" => {
            let reason = rest.join(" ");
            Command::EmergencyStop(if reason.is_empty() {
                "operator console".to_string()
            } else {
                reason
            })
        }
        "/reset" => Command::Reset,
        "/ack" => match rest.as_slice() {
            [kind] => Command::Ack(kind.to_string()),
            _ => return Err("usage: /ack <interlock>".to_string()),
        },
        "/geofence" => Command::Geofence,
        "/jobs" => Command::Jobs,
        "/job" => parse_job(&rest)?,
        "/drivers" => Command::Drivers,
        "/bundle" => Command::Bundle(rest.join(" ")),
        "/bundles" => Command::Bundles,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(cmd)
}

fn parse_job(args: &[&str]) -> Result<Command, String> {
    match args {
        ["add", name, schedule @ ..] if schedule.len() == 5 => Ok(Command::JobAdd {
            name: name.to_string(),
            schedule: schedule.join(" "),
        }),
        ["add", ..] => Err("usage: /job add <name> <min> <hour> <dom> <month> <dow>".to_string()),
        ["start", id] => Ok(Command::JobStart(parse_id(id)?)),
        ["cancel", id] => Ok(Command::JobCancel(parse_id(id)?)),
        ["rm", id] => Ok(Command::JobRemove(parse_id(id)?)),
        _ => Err("usage: /job add|start|cancel|rm ...".to_string()),
    }
}

fn parse_number(raw: &str) -> Result<f32, String> {
    raw.parse::<f32>()
        .map_err(|_| format!("'{raw}' is not a number"))
}

fn parse_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|_| format!("'{raw}' is not a job id"))
}

/// Entry point for the interactive console.
///
/// `shutdown` is polled each iteration; when set the loop exits. Ctrl-C at
/// the prompt engages the emergency stop before exiting.
pub fn run(runtime: &Runtime, api: &Arc<ControlApi>, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Console unavailable".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "mower>".bold().green());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                crate::emergency_stop(runtime.handle(), api, "operator Ctrl-C");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Command::Help) => cmd_help(),
            Ok(cmd) => {
                if let Err(e) = runtime.block_on(execute(api, cmd)) {
                    println!("{} {}", format!("[{}]", e.status_code()).red().bold(), e);
                }
            }
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg,
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn execute(api: &ControlApi, cmd: Command) -> Result<(), ApiError> {
    match cmd {
        Command::Status => print_status(&api.status().await?),
        Command::Drive {
            linear_mps,
            angular_rps,
        } => {
            api.drive(linear_mps, angular_rps).await?;
            ok("drive command accepted");
        }
        Command::Blade(enabled) => {
            api.blade(enabled).await?;
            ok(if enabled { "blade on" } else { "blade off" });
        }
        Command::Stop => {
            api.stop().await?;
            ok("stopped");
        }
        Command::Mode(name) => {
            let mode = api.set_mode_named(&name).await?;
            ok(&format!("mode is now {mode}"));
        }
        Command::EmergencyStop(reason) => {
            api.emergency_stop(&reason).await?;
            println!("{}", "EMERGENCY STOP engaged".red().bold());
        }
        Command::Reset => {
            api.reset().await?;
            ok("reset to idle");
        }
        Command::Ack(kind) => {
            api.acknowledge_named(&kind).await?;
            ok(&format!("{kind} acknowledged"));
        }
        Command::Geofence => match api.geofence().await? {
            Some(info) => println!(
                "  {} {} ({:.1} m², {} vertices, buffer {:.2} m)",
                info.spec.name.bold(),
                info.id.to_string().dimmed(),
                info.area_m2,
                info.spec.vertices.len(),
                info.spec.buffer_m
            ),
            None => println!("  {}", "no geofence set".dimmed()),
        },
        Command::Jobs => {
            let jobs = api.jobs().await?;
            if jobs.is_empty() {
                println!("  {}", "no jobs".dimmed());
            }
            for job in jobs {
                let next = job
                    .next_run
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {}  {:<16} {:<10} {:<12} next {}  retries {}{}",
                    job.id.to_string().dimmed(),
                    job.name.bold(),
                    job.state.to_string().yellow(),
                    job.schedule,
                    next,
                    job.retry_count,
                    job.last_reason
                        .map(|r| format!("  ({r})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::JobAdd { name, schedule } => {
            let job = api
                .create_job(JobSpec {
                    name,
                    schedule,
                    enabled: true,
                })
                .await?;
            ok(&format!("job {} created", job.id));
        }
        Command::JobStart(id) => {
            let job = api.start_job(id).await?;
            ok(&format!("job {} is {}", job.name, job.state));
        }
        Command::JobCancel(id) => {
            let job = api.cancel_job(id).await?;
            ok(&format!("job {} is {}", job.name, job.state));
        }
        Command::JobRemove(id) => {
            let job = api.delete_job(id).await?;
            ok(&format!("job {} deleted", job.name));
        }
        Command::Drivers => {
            for driver in api.drivers() {
                let health = driver.health.to_string();
                let health = match health.as_str() {
                    "healthy" => health.green(),
                    "degraded" => health.yellow(),
                    _ => health.red(),
                };
                println!(
                    "  {:<8} {:<16} {:<18} {:<8} {}{}",
                    driver.id.bold(),
                    format!("{:?}", driver.kind),
                    driver.resource.dimmed(),
                    driver.state,
                    health,
                    driver
                        .last_error
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::Bundle(note) => {
            let note = if note.is_empty() { "operator request".to_string() } else { note };
            let bundle = api.request_bundle(&note).await?;
            ok(&format!("bundle {} archived ({} bytes)", bundle.id, bundle.size_bytes));
        }
        Command::Bundles => {
            for b in api.bundles().await? {
                println!(
                    "  {}  {}  {:<24} {:>10} B{}",
                    b.id.to_string().dimmed(),
                    b.created_at.format("%Y-%m-%d %H:%M:%S"),
                    b.trigger,
                    b.size_bytes,
                    if b.retained { "  retained" } else { "" }
                );
            }
        }
        Command::Help | Command::Quit => {}
    }
    Ok(())
}

fn print_status(report: &StatusReport) {
    let s = &report.state;
    println!("{}", "Status".bold().underline());
    println!("  Mode      : {}", s.navigation_mode.to_string().bold());
    match s.position {
        Some(p) => println!(
            "  Position  : ({:.2}, {:.2}) m  heading {:.0}°  {:.2} m/s",
            p.x, p.y, s.heading_deg, s.velocity_mps
        ),
        None => println!("  Position  : {}", "no fix".yellow()),
    }
    match s.battery_percent {
        Some(pct) => println!(
            "  Battery   : {:.0}%  ({:.2} V)",
            pct,
            s.battery_voltage.unwrap_or_default()
        ),
        None => println!("  Battery   : {}", "unknown".yellow()),
    }
    if !s.watchdog_healthy {
        println!("  Watchdog  : {}", "component silent".red());
    }
    if report.interlocks.is_empty() {
        println!("  Interlocks: {}", "clear".green());
    } else {
        println!("  Interlocks:");
        for rec in &report.interlocks {
            println!(
                "    {} {:<20} {:?}  {}",
                "●".red(),
                rec.kind.to_string().bold(),
                rec.status,
                rec.detail.dimmed()
            );
        }
    }
    match &report.active_job {
        Some(job) => println!("  Job       : {} ({})", job.name.bold(), job.state),
        None => println!("  Job       : {}", "none".dimmed()),
    }
    if let Some(p) = &report.pattern {
        println!(
            "  Pattern   : {}/{} waypoints, {:.0} m, ~{:.0} min",
            p.completed,
            p.waypoints,
            p.path_length_m,
            p.estimated_duration_s / 60.0
        );
    }
    if let Some(f) = &report.forecast {
        println!(
            "  Forecast  : rain {:.0}%  wind {:.0} mph  {:.1}°C",
            f.rain_probability * 100.0,
            f.wind_mph,
            f.temperature_c
        );
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Mower Console".bold().underline());
    let rows = [
        ("/status", "fused state, interlocks, job and forecast"),
        ("/drive <lin> <ang>", "manual drive (MANUAL mode)"),
        ("/blade on|off", "blade motor"),
        ("/stop", "stop all motors"),
        ("/mode <mode>", "idle, manual or autonomous"),
        ("/estop [reason]", "operator emergency stop"),
        ("/reset", "leave EMERGENCY_STOP"),
        ("/ack <interlock>", "acknowledge a cleared interlock"),
        ("/geofence", "show the active geofence"),
        ("/jobs", "list mowing jobs"),
        ("/job add <name> <cron>", "create a job"),
        ("/job start|cancel|rm <id>", "manage a job"),
        ("/drivers", "driver health"),
        ("/bundle [note]", "capture a diagnostics bundle"),
        ("/bundles", "list archived bundles"),
        ("/quit  /exit", "stop the core and exit"),
    ];
    for (cmd, what) in rows {
        println!("  {:<28} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn ok(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_drive_and_blade() {
        assert_eq!(
            parse("/drive 0.5 -0.2"),
            Ok(Command::Drive {
                linear_mps: 0.5,
                angular_rps: -0.2
            })
        );
        assert_eq!(parse("/blade off"), Ok(Command::Blade(false)));
        assert!(parse("/drive fast").is_err());
        assert!(parse("/blade maybe").is_err());
    }

    #[test]
    fn job_add_takes_five_cron_fields() {
        assert_eq!(
            parse("/job add backyard 0 9 * * 1-5"),
            Ok(Command::JobAdd {
                name: "backyard".to_string(),
                schedule: "0 9 * * 1-5".to_string()
            })
        );
        assert!(parse("/job add backyard 0 9 * *").is_err());
    }

    #[test]
    fn job_ids_must_be_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(parse(&format!("/job start {id}")), Ok(Command::JobStart(id)));
        assert!(parse("/job cancel 42").is_err());
    }

    #[test]
    fn estop_has_default_reason() {
        assert_eq!(
            parse("/estop"),
            Ok(Command::EmergencyStop("operator console".to_string()))
        );
        assert_eq!(
            parse("/estop dog on lawn"),
            Ok(Command::EmergencyStop("dog on lawn".to_string()))
        );
    }

    #[test]
    fn unknown_commands_are_errors() {
        let err = parse("/dance").unwrap_err();
        assert!(err.contains("/dance"));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
    }
}
