//! LedFx realtime engine
//!
//! Captures audio, extracts spectral features, renders an LED effect and
//! streams it to a WLED-compatible controller over UDP.

pub mod audio;
pub mod clock;
pub mod config;
pub mod effects;
pub mod engine;
pub mod protocol;

pub use config::{Backend, Config, ConfigUpdate, EffectKind, Endpoint, Protocol};
pub use engine::{Diagnostics, Engine, EngineError, EngineState, StopReason};

use clap::{CommandFactory, Parser};
use config::ConfigError;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Command-line errors
#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to list devices: {0}")]
    Devices(#[from] audio::SourceError),
}

/// Drive a WLED strip from live audio
#[derive(Parser, Debug)]
#[command(name = "ledfx", version, about, long_about = None)]
struct Opt {
    /// JSON config file
    #[arg(value_name = "CONFIG", required_unless_present = "list_devices")]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for stdin
    #[arg(long, value_name = "SECONDS")]
    seconds: Option<u64>,

    /// Print the available input devices as JSON lines and exit
    #[arg(long)]
    list_devices: bool,
}

/// Flag raised when stdin reaches EOF or a line is entered
fn watch_stdin() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    let spawned = thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            raised.store(true, Ordering::Release);
        });
    if let Err(e) = spawned {
        log::warn!("Cannot watch stdin, stop with Ctrl-C: {}", e);
    }
    flag
}

fn run_engine(config_path: &Path, seconds: Option<u64>) -> Result<(), CliError> {
    let config = Config::load(config_path)?;
    log::info!(
        "Driving {} LEDs at {}:{} with {}",
        config.led_count,
        config.endpoint.host,
        config.endpoint.port,
        config.effect.name()
    );

    let engine = Engine::new();
    let lost = Arc::new(AtomicBool::new(false));
    let lost_flag = lost.clone();
    engine.set_on_stopped(move |reason| {
        log::error!("Engine stopped: {:?}", reason);
        lost_flag.store(true, Ordering::Release);
    });
    engine.start(config)?;

    let quit = watch_stdin();
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut next_report = Instant::now() + Duration::from_secs(1);

    loop {
        if quit.load(Ordering::Acquire) || lost.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        if now >= next_report {
            next_report += Duration::from_secs(1);
            match serde_json::to_string(&engine.diagnostics()) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("Failed to serialise diagnostics: {}", e),
            }
        }
        thread::sleep(Duration::from_millis(50));
    }

    engine.stop();
    if let Ok(line) = serde_json::to_string(&engine.diagnostics()) {
        println!("{}", line);
    }
    Ok(())
}

fn list_devices() -> Result<(), CliError> {
    for device in audio::list_input_devices()? {
        match serde_json::to_string(&device) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("Failed to serialise device: {}", e),
        }
    }
    Ok(())
}

/// Entry point of the `ledfx` binary
pub fn run() {
    env_logger::init();

    let opt = Opt::parse();
    let result = if opt.list_devices {
        list_devices()
    } else if let Some(config_path) = opt.config.as_deref() {
        run_engine(config_path, opt.seconds)
    } else {
        Opt::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "a config file is required",
            )
            .exit()
    };

    if let Err(e) = result {
        eprintln!("ledfx: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn command_line_is_well_formed() {
        Opt::command().debug_assert();
    }

    #[test]
    fn parses_config_and_seconds() {
        let opt = Opt::try_parse_from(["ledfx", "strip.json", "--seconds", "5"]).unwrap();
        assert_eq!(opt.config, Some(PathBuf::from("strip.json")));
        assert_eq!(opt.seconds, Some(5));
        assert!(!opt.list_devices);
    }

    #[test]
    fn list_devices_needs_no_config() {
        let opt = Opt::try_parse_from(["ledfx", "--list-devices"]).unwrap();
        assert!(opt.list_devices);
        assert_eq!(opt.config, None);
    }

    #[test]
    fn rejects_bad_arguments() {
        let kind = |args: &[&str]| Opt::try_parse_from(args).unwrap_err().kind();
        assert_eq!(kind(&["ledfx"]), ErrorKind::MissingRequiredArgument);
        assert_eq!(kind(&["ledfx", "a.json", "--seconds"]), ErrorKind::InvalidValue);
        assert_eq!(kind(&["ledfx", "a.json", "--seconds", "soon"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["ledfx", "a.json", "b.json"]), ErrorKind::UnknownArgument);
        assert_eq!(kind(&["ledfx", "a.json", "--verbose"]), ErrorKind::UnknownArgument);
    }
}
