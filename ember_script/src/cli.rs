use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Demo host that runs mod scripts against the hook and archive core",
    version
)]
pub struct Args {
    /// Lua scripts to load, in order
    #[arg(long = "script", value_name = "PATH")]
    pub scripts: Vec<PathBuf>,

    /// Number of think frames to run
    #[arg(long, default_value_t = 8)]
    pub ticks: u32,

    /// Actors to spawn before the tick loop
    #[arg(long, default_value_t = 3)]
    pub actors: u16,

    /// Fire a trigger with this tag after the tick loop
    #[arg(long)]
    pub trigger: Option<String>,

    /// Write the archived scripting state to this file
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Restore scripting state from this file before the tick loop
    #[arg(long)]
    pub load: Option<PathBuf>,

    /// Path to write the hook registry summary as JSON
    #[arg(long)]
    pub registry_json: Option<PathBuf>,

    /// Time each frame callback and print a profile afterwards
    #[arg(long)]
    pub profile: bool,

    /// Print verbose diagnostics (repeats per-callback warnings)
    #[arg(long)]
    pub verbose: bool,
}

pub fn parse() -> Args {
    Args::parse()
}
