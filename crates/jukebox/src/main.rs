//! Jukebox: a single-process audio player driven by remote clients.
//!
//! `listen` runs the daemon: tracks come from configured providers, play on a local
//! output device, and every client connected to the Unix socket can play, pause, resume
//! or stop them while receiving each state change. The other subcommands are a small
//! client for that socket.

use anyhow::Result;
use clap::Parser;

use jukebox::cli::{Args, Command};
use jukebox::command::{self, ClientCommand, RESPONSE_TIMEOUT};
use jukebox::config::{self, JukeboxConfig};
use jukebox::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = JukeboxConfig::load_or_default(args.config.as_deref())?;
    runtime::init_tracing(&config::log_filter_from_config(&cfg, args.log_level.as_deref()));

    let socket_path = config::socket_path_from_config(&cfg, args.socket.as_deref());
    let client_command = match args.cmd {
        Command::ListDevices => return runtime::list_devices(),
        Command::Listen { device } => {
            let listen = runtime::ListenConfig {
                socket_path,
                device: config::device_from_config(&cfg, device.as_deref()),
                playback: config::playback_from_config(&cfg)?,
                providers: cfg.providers.unwrap_or_default(),
            };
            return runtime::run_listen(listen);
        }
        Command::Play {
            provider,
            track,
            playlist,
            user,
        } => ClientCommand::play(provider, track, playlist, user),
        Command::Pause => ClientCommand::Pause,
        Command::Resume => ClientCommand::Resume,
        Command::Stop => ClientCommand::Stop,
    };

    let event = command::run(&socket_path, &client_command, RESPONSE_TIMEOUT)?;
    match event.payload {
        Some(payload) => println!("{} {}", event.kind, payload),
        None => println!("{}", event.kind),
    }
    Ok(())
}
