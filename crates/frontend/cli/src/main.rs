mod script;
mod settings;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use framestep_core::logging::{LogCategory, LogConfig, LogLevel};
use framestep_core::{Action, ControllerError, InputVector, Session};
use framestep_snes::SnesEngine;
use settings::Settings;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "framestep", version, about = "Headless frame-stepped SNES runner")]
struct Cli {
    /// Settings file (default: framestep.json next to the executable)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine log level: off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Per-category engine log level, e.g. `cpu=trace` (repeatable)
    #[arg(long = "log", global = true, value_name = "CATEGORY=LEVEL")]
    log_overrides: Vec<String>,

    /// Append engine logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the cartridge header summary
    Info {
        rom: PathBuf,
    },
    /// Step frames synchronously, or warp through them with one tick
    Run(RunArgs),
    /// Feed an input script through the background controller
    Play(PlayArgs),
}

#[derive(Args)]
struct RunArgs {
    rom: PathBuf,

    /// Number of frames to run
    #[arg(long)]
    frames: Option<u32>,

    /// Buttons held for the whole run, comma separated (e.g. `Right,B`)
    #[arg(long, value_delimiter = ',')]
    hold: Vec<String>,

    /// Compose the picture every frame (only the last one with --warp)
    #[arg(long, default_value_t = false)]
    render: bool,

    /// Restore this save state before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a save state after running
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Write work RAM to this file after running
    #[arg(long)]
    dump_ram: Option<PathBuf>,

    /// Run all frames in a single tick
    #[arg(long, default_value_t = false)]
    warp: bool,
}

#[derive(Args)]
struct PlayArgs {
    rom: PathBuf,

    /// JSON list of `{ "buttons": ..., "frames": n }` entries
    script: PathBuf,

    /// 1.0 is real time, 0 runs uncapped
    #[arg(long)]
    speed: Option<f64>,

    /// Print a report every N frames
    #[arg(long)]
    report_every: Option<u32>,
}

/// What `run` did, for printing.
#[derive(Debug, Clone, PartialEq)]
struct RunSummary {
    frames: u32,
    width: u32,
    height: u32,
    ram_crc: u32,
    elapsed: Duration,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref());

    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    let log_file = cli.log_file.as_ref().or(settings.log_file.as_ref());
    configure_logging(level, &cli.log_overrides, log_file.map(PathBuf::as_path))?;

    match &cli.command {
        Command::Info { rom } => info(rom),
        Command::Run(args) => {
            let summary = run(args, &settings)?;
            let secs = summary.elapsed.as_secs_f64();
            let fps = if secs > 0.0 {
                summary.frames as f64 / secs
            } else {
                0.0
            };
            println!(
                "{} frames in {:.2?} ({:.0} fps)",
                summary.frames, summary.elapsed, fps
            );
            println!("screen {}x{}", summary.width, summary.height);
            println!("ram crc32 {:08X}", summary.ram_crc);
            Ok(())
        }
        Command::Play(args) => play(args, &settings),
    }
}

fn configure_logging(level: &str, overrides: &[String], file: Option<&Path>) -> Result<()> {
    let config = LogConfig::global();
    let Some(global) = LogLevel::from_str(level) else {
        bail!("unknown log level: {}", level);
    };
    config.set_global_level(global);

    for entry in overrides {
        let Some((name, level)) = entry.split_once('=') else {
            bail!("expected CATEGORY=LEVEL, got {:?}", entry);
        };
        let category = LogCategory::from_name(name)
            .with_context(|| format!("unknown log category: {}", name))?;
        let level =
            LogLevel::from_str(level).with_context(|| format!("unknown log level: {}", level))?;
        config.set_level(category, level);
    }

    if let Some(path) = file {
        config
            .set_log_file(path.to_path_buf())
            .with_context(|| format!("failed to open log file {}", path.display()))?;
    }
    Ok(())
}

fn open_session(rom: &Path) -> Result<Session<SnesEngine>> {
    let mut session = Session::new(SnesEngine::new());
    session.load_rom_from_path(rom)?;
    Ok(session)
}

fn info(rom: &Path) -> Result<()> {
    let session = open_session(rom)?;
    let info = session
        .engine()
        .cartridge_info()
        .context("no cartridge after load")?;
    println!("Title:         {}", info.title);
    println!("Mapping:       {}", info.mapping);
    println!("ROM size:      {} KB", info.rom_size / 1024);
    println!("SRAM size:     {} KB", info.sram_size / 1024);
    println!("Copier header: {}", if info.has_copier_header { "yes" } else { "no" });
    println!("CRC32:         {:08X}", info.crc32);
    Ok(())
}

fn run(args: &RunArgs, settings: &Settings) -> Result<RunSummary> {
    let mut session = open_session(&args.rom)?;
    if let Some(path) = &args.load_state {
        let blob = fs::read(path)
            .with_context(|| format!("failed to read state {}", path.display()))?;
        session.load_state(&blob)?;
        log::info!("restored {}", path.display());
    }

    let input = InputVector::from_names(&args.hold)?;
    let action = Action::from(input);
    let frames = args.frames.unwrap_or(settings.frames);
    log::info!("running {} frames holding {}", frames, input);

    let started = Instant::now();
    if args.warp {
        session.tick(frames, args.render, Some(&action))?;
    } else {
        for _ in 0..frames {
            session.advance(input, args.render)?;
        }
    }
    let elapsed = started.elapsed();

    if let Some(path) = &args.save_state {
        fs::write(path, session.save_state()?)
            .with_context(|| format!("failed to write state {}", path.display()))?;
        log::info!("saved state to {}", path.display());
    }
    if let Some(path) = &args.dump_ram {
        fs::write(path, session.memory())
            .with_context(|| format!("failed to write RAM dump {}", path.display()))?;
    }

    let screen = session.screen();
    Ok(RunSummary {
        frames,
        width: screen.width,
        height: screen.height,
        ram_crc: crc32fast::hash(session.memory()),
        elapsed,
    })
}

fn play(args: &PlayArgs, settings: &Settings) -> Result<()> {
    let steps = script::load(&args.script)?;
    let total = script::total_frames(&steps);
    if total == 0 {
        bail!("script {} has no frames to play", args.script.display());
    }

    let session = open_session(&args.rom)?;
    let mut ctrl = session.into_controller(settings.controller.clone());
    for step in &steps {
        ctrl.queue_action(step.input, step.frames);
    }

    let every = args.report_every.unwrap_or(settings.report_every);
    ctrl.add_observer(every, |view| {
        println!(
            "frame {:>6}  input {:<24}  ram {:08X}",
            view.frame_number,
            view.input.to_string(),
            crc32fast::hash(view.memory)
        );
        Ok(())
    });

    let speed = args.speed.unwrap_or(settings.speed);
    log::info!("playing {} frames at speed {}", total, speed);
    ctrl.start(speed)?;
    loop {
        match ctrl.wait_for_frame(total, Duration::from_millis(250)) {
            Ok(count) if count >= total => break,
            Ok(_) => continue,
            // The loop ended on its own; stop() collects the fault
            Err(ControllerError::NotRunning) => break,
            Err(e) => return Err(e.into()),
        }
    }
    if !ctrl.stop() {
        bail!("engine thread did not stop");
    }
    if let Some(fault) = ctrl.take_fault() {
        bail!("engine fault: {}", fault);
    }
    println!("played {} frames", ctrl.frame_count());
    Ok(())
}
