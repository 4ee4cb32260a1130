use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use flowgate_common::consts;

#[derive(Parser)]
#[command(
    name = "flowgate",
    version,
    about = "Control the Flowgate firewall policy service"
)]
pub struct Cli {
    /// Service data directory (where the control socket lives).
    #[arg(long, global = true, default_value = consts::DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Explicit control socket path; overrides --data-dir.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

impl Cli {
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join(consts::SOCKET_FILE))
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Service liveness, version and uptime
    #[command(alias = "ping")]
    Status,
    /// Create the provider and sublayer in the filtering engine
    Bootstrap,
    /// Remove the provider and sublayer (requires an empty sublayer)
    Teardown,
    /// Validate a policy file without applying it
    Validate { file: PathBuf },
    /// Apply a policy file
    Apply { file: PathBuf },
    /// Remove every managed filter
    Rollback,
    /// Last-known-good policy
    Lkg {
        #[command(subcommand)]
        cmd: LkgCmd,
    },
    /// Hot-reload watcher on a policy file
    Watch {
        #[command(subcommand)]
        cmd: WatchCmd,
    },
    /// Audit log entries
    Logs(LogsArgs),
    /// Fixed end-to-end verification filter
    DemoBlock {
        #[command(subcommand)]
        cmd: DemoBlockCmd,
    },
    /// Evaluate a hypothetical connection against the loaded policy
    Simulate(SimulateArgs),
    /// Enabled block rules of the loaded policy
    BlockRules,
    /// Applied-policy history
    History {
        #[command(subcommand)]
        cmd: HistoryCmd,
    },
}

#[derive(Subcommand)]
pub enum LkgCmd {
    Show,
    Revert,
}

#[derive(Subcommand)]
pub enum WatchCmd {
    /// Watch a file, or clear the watch when no file is given
    Set { file: Option<PathBuf> },
    Status,
}

#[derive(Args)]
pub struct LogsArgs {
    /// Newest N entries
    #[arg(long, conflicts_with = "since")]
    pub tail: Option<usize>,
    /// Entries from the last M minutes
    #[arg(long)]
    pub since: Option<i64>,
}

#[derive(Subcommand)]
pub enum DemoBlockCmd {
    Enable,
    Disable,
    Status,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long)]
    pub direction: String,
    #[arg(long)]
    pub protocol: String,
    #[arg(long)]
    pub remote_ip: Option<String>,
    #[arg(long)]
    pub remote_port: Option<u16>,
    #[arg(long)]
    pub local_ip: Option<String>,
    #[arg(long)]
    pub local_port: Option<u16>,
    #[arg(long)]
    pub process: Option<String>,
}

#[derive(Subcommand)]
pub enum HistoryCmd {
    List,
    Show { id: String },
    Revert { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ping_is_an_alias_for_status() {
        let cli = Cli::parse_from(["flowgate", "ping"]);
        assert!(matches!(cli.cmd, Command::Status));
    }

    #[test]
    fn socket_defaults_under_data_dir() {
        let cli = Cli::parse_from(["flowgate", "--data-dir", "/tmp/fg", "status"]);
        assert_eq!(
            cli.socket_path(),
            PathBuf::from("/tmp/fg").join(consts::SOCKET_FILE)
        );
    }

    #[test]
    fn explicit_socket_wins() {
        let cli = Cli::parse_from(["flowgate", "--socket", "/run/x.sock", "status"]);
        assert_eq!(cli.socket_path(), PathBuf::from("/run/x.sock"));
    }

    #[test]
    fn logs_flags_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["flowgate", "logs", "--tail", "5", "--since", "10"]).is_err());
    }
}
