use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::cleanup::CleanupArgs;
use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the executor lifecycle daemon
    Daemon(Box<DaemonArgs>),
    /// Remove every backend created by earlier executor instances, then exit
    Cleanup(CleanupArgs),
}
