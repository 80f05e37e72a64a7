use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "jukebox", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Unix socket path (overrides the config)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,jukebox_player=debug" (RUST_LOG wins when set)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the jukebox daemon until interrupted
    Listen {
        /// Use a specific output device by substring match
        #[arg(long)]
        device: Option<String>,
    },

    /// List output devices and exit
    ListDevices,

    /// Ask the daemon to play a track
    Play {
        /// Provider name
        #[arg(short = 'n', long = "provider")]
        provider: String,

        /// Provider-specific track id
        #[arg(short = 't', long = "track")]
        track: String,

        /// Playlist id (generated when omitted)
        #[arg(short = 'i', long = "playlist")]
        playlist: Option<String>,

        /// User id
        #[arg(short = 'u', long = "user")]
        user: Option<String>,
    },

    /// Pause the current track
    Pause,

    /// Resume the paused track
    Resume,

    /// Stop the current track
    Stop,
}
