//! Device Router - audio and MIDI passthrough test tool
//!
//! Entry point for the command line.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use device_router::config::RouterConfig;
use device_router::device::{DeviceDescriptor, DeviceLists};
use device_router::engine::ConnectionController;

const USAGE: &str = "usage: device_router [--config PATH] list | audio IN OUT | midi IN OUT";

enum Command {
    List,
    Audio(usize, usize),
    Midi(usize, usize),
}

fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Command), String> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().ok_or("--config needs a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.as_str());
        }
    }

    let index = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| format!("'{}' is not a device index", s))
    };

    let command = match rest.as_slice() {
        ["list"] => Command::List,
        ["audio", input, output] => Command::Audio(index(*input)?, index(*output)?),
        ["midi", input, output] => Command::Midi(index(*input)?, index(*output)?),
        _ => return Err(USAGE.to_string()),
    };
    Ok((config, command))
}

fn print_list(title: &str, devices: &[DeviceDescriptor]) {
    println!("{}:", title);
    for (i, device) in devices.iter().enumerate() {
        println!("  [{}] {}", i, device.display_name);
    }
}

fn print_devices(devices: &DeviceLists) {
    print_list("Audio inputs", &devices.audio_inputs);
    print_list("Audio outputs", &devices.audio_outputs);
    print_list("MIDI inputs", &devices.midi_inputs);
    print_list("MIDI outputs", &devices.midi_outputs);
}

fn wait_for_enter() {
    println!("Routing. Press Enter to stop.");
    let mut line = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
        log::warn!("Failed to read stdin: {}", e);
    }
}

fn main() -> ExitCode {
    // Initialize logger - set RUST_LOG=debug for per-step output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    let config = match config_path {
        Some(path) => match RouterConfig::load_from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => RouterConfig::default(),
    };

    let mut controller = ConnectionController::with_system(&config);

    let connected = match command {
        Command::List => {
            print_devices(controller.devices());
            return ExitCode::SUCCESS;
        }
        Command::Audio(input, output) => {
            controller.set_audio_test_enabled_by_index(true, input, output)
                && controller.audio().is_connected()
        }
        Command::Midi(input, output) => {
            controller.set_midi_test_enabled_by_index(true, input, output)
                && controller.midi().is_connected()
        }
    };

    if !connected {
        eprintln!("Connection failed");
        return ExitCode::FAILURE;
    }

    wait_for_enter();
    controller.end_session();

    let audio = controller.audio().stats();
    let midi = controller.midi().stats();
    log::info!(
        "Session ended: {} audio frames forwarded, {} dropped; {} MIDI messages forwarded",
        audio.frames_forwarded,
        audio.frames_dropped,
        midi.messages_forwarded
    );
    ExitCode::SUCCESS
}
