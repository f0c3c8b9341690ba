//! Phasmophobia global voice chat fixer.
//!
//! Attaches to a running Phasmophobia process, resolves the walkie-talkie
//! state through the IL2CPP runtime and keeps the remote players'
//! `isGhostSpawned` flags in sync so the global voice chat glitch can't
//! stick.

use std::process::ExitCode;
use std::time::Duration;

use log::{error, info, warn, LevelFilter};

use phasmo_vc_fixer::{Error, PhasmoMemory, WalkieTalkieFix};

const OPEN_RETRY_DELAY: Duration = Duration::from_secs(5);
const INIT_RETRY_DELAY: Duration = Duration::from_secs(5);
const FIX_DELAY: Duration = Duration::from_secs(5);
const MAX_INIT_ATTEMPTS: u32 = 30;

struct Args {
    verbose: bool,
    singleshot: bool,
    load_cache: bool,
    save_cache: bool,
    fix: WalkieTalkieFix,
}

fn print_help(prog: &str) {
    println!(
        "Usage: {prog} [OPTIONS]...\n\
         \x20 -h, --help           print this message and exit\n\
         \x20 -v, --verbose        print extended debug messages\n\
         \x20 -s, --singleshot     do not run in a loop, quit after one fix attempt\n\
         \x20 --dont-load-cache    bypass the cache and resolve the offsets from the game's memory\n\
         \x20 --dont-save-cache    don't save the offsets to cache\n\
         \x20 --force [1/0]        force the isGhostSpawned flag to true or false (for demonstration)"
    );
}

fn parse_args(argv: &[String], prog: &str) -> Result<Args, ExitCode> {
    let mut args = Args {
        verbose: false,
        singleshot: false,
        load_cache: true,
        save_cache: true,
        fix: WalkieTalkieFix::Auto,
    };

    let mut iter = argv.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help(prog);
                return Err(ExitCode::SUCCESS);
            }
            "-v" | "--verbose" => args.verbose = true,
            "-s" | "--singleshot" => args.singleshot = true,
            "--dont-load-cache" => args.load_cache = false,
            "--dont-save-cache" => args.save_cache = false,
            "--force" => match iter.next().map(String::as_str) {
                Some("0") => args.fix = WalkieTalkieFix::ForceOff,
                Some("1") => args.fix = WalkieTalkieFix::ForceOn,
                Some(other) => {
                    eprintln!("Invalid argument '{other}' for --force");
                    print_help(prog);
                    return Err(ExitCode::FAILURE);
                }
                None => {
                    eprintln!("Not enough arguments for --force");
                    print_help(prog);
                    return Err(ExitCode::FAILURE);
                }
            },
            other => {
                eprintln!("Invalid argument '{other}'");
                print_help(prog);
                return Err(ExitCode::FAILURE);
            }
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let prog = argv
        .first()
        .map(|arg0| {
            std::path::Path::new(arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg0.clone())
        })
        .unwrap_or_else(|| env!("CARGO_BIN_NAME").to_string());

    let args = match parse_args(&argv, &prog) {
        Ok(args) => args,
        Err(code) => return code,
    };

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp(None)
        .init();

    println!("--- Phasmophobia global voice chat fixer ---");

    #[cfg(target_os = "windows")]
    if !is_elevated::is_elevated() {
        warn!("not running elevated; opening the game will likely be denied");
    }

    let mut phasmo = PhasmoMemory::new();
    phasmo.set_load_cache(args.load_cache);
    phasmo.set_save_cache(args.save_cache);

    // Wait for the game.
    loop {
        match phasmo.open() {
            Ok(()) => break,
            Err(Error::NotFound) if !args.singleshot => {
                info!(
                    "waiting for Phasmophobia, retrying in {:?}",
                    OPEN_RETRY_DELAY
                );
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(Error::NotFound) => {
                error!("Phasmophobia is not running");
                return ExitCode::FAILURE;
            }
            Err(Error::NoPrivileges) => {
                #[cfg(target_os = "linux")]
                {
                    warn!("no permission to read the game's memory, re-running with sudo");
                    // Re-executes the process elevated and never returns on
                    // success; if we're still here, it failed.
                    let _ = sudo::escalate_if_needed();
                }
                error!("didn't have permission to open Phasmophobia");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("error while trying to open Phasmophobia: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    info!("opened Phasmophobia [pid: {}]", phasmo.pid().unwrap_or(0));

    // Resolve the offsets; the game may still be loading, so keep at it for
    // a bounded number of attempts.
    let max_attempts = if args.singleshot { 1 } else { MAX_INIT_ATTEMPTS };
    let mut attempt = 1;
    loop {
        match phasmo.init() {
            Ok(()) => break,
            Err(e) => {
                error!(
                    "couldn't initialize offsets (attempt {attempt}/{max_attempts}): {e}"
                );
                if !e.is_retryable() || attempt >= max_attempts {
                    return ExitCode::FAILURE;
                }
                attempt += 1;
                info!("retrying in {:?}", INIT_RETRY_DELAY);
                std::thread::sleep(INIT_RETRY_DELAY);
            }
        }
    }

    // Pulse the fix.
    if args.singleshot {
        if let Err(e) = phasmo.fix_walkie_talkies(args.fix) {
            error!("encountered an error while trying to apply the fix: {e}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    info!("running in loop mode, press CTRL-C to quit");
    loop {
        match phasmo.fix_walkie_talkies(args.fix) {
            Ok(()) => {}
            Err(Error::ProcessExited) => {
                info!("Phasmophobia was closed, shutting down");
                return ExitCode::SUCCESS;
            }
            Err(e) => error!("encountered an error while trying to apply the fix: {e}"),
        }
        if !phasmo.is_open() {
            info!("Phasmophobia was closed, shutting down");
            return ExitCode::SUCCESS;
        }
        std::thread::sleep(FIX_DELAY);
    }
}
