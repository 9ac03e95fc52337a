use std::path::PathBuf;

use clap::Parser;

/// Argument surface shared by the send and fetch workers. The dispatcher
/// passes everything positionally; the flags tune one job.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct WorkerCli {
    /// Root of the runtime tree (spool, fifos, status areas, logs).
    pub work_dir: PathBuf,
    /// Slot number inside the host record.
    pub job_no: usize,
    /// Id of the status area generation this job was queued against.
    pub fsa_id: u32,
    /// Host position inside the status area.
    pub fsa_pos: usize,
    /// Message name (send) or directory alias (fetch).
    pub msg_or_dir: String,
    /// Distributed helper started on a "more files" hint.
    #[arg(short = 'd')]
    pub distributed: bool,
    /// Retry attempts for transient local operations.
    #[arg(short = 'o', value_name = "RETRIES")]
    pub retries: Option<usize>,
    /// Use the secondary hostname for this job.
    #[arg(short = 't')]
    pub temp_toggle: bool,
    /// Discard spool files older than this many seconds.
    #[arg(short = 'a', value_name = "SECONDS")]
    pub age_limit: Option<u64>,
    /// Resume fetches from the previously observed size.
    #[arg(short = 'A')]
    pub append_only: bool,
    /// Delete remote files after retrieval.
    #[arg(short = 'r')]
    pub remove: bool,
    /// Verbose tracing to the worker log.
    #[arg(long)]
    pub debug: bool,
}

/// Monitor arguments, plus the hidden child modes the supervisor re-spawns
/// itself with.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct MonCli {
    /// Root of the runtime tree; defaults to the current directory.
    #[arg(short = 'w', value_name = "DIR")]
    pub work_dir: Option<PathBuf>,
    /// Internal: run as the peer-poll child for this peer position.
    #[arg(long, hide = true, value_name = "POS")]
    pub peer_poll: Option<usize>,
    /// Internal: run as the log-fetch child for this peer position.
    #[arg(long, hide = true, value_name = "POS")]
    pub log_fetch: Option<usize>,
    /// Verbose tracing to the monitor log.
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_args_parse_positionally() {
        let cli = WorkerCli::parse_from([
            "fr-send", "/var/afd", "2", "7", "0", "msg-001", "-o", "5", "-t",
        ]);
        assert_eq!(cli.work_dir, PathBuf::from("/var/afd"));
        assert_eq!(cli.job_no, 2);
        assert_eq!(cli.fsa_id, 7);
        assert_eq!(cli.fsa_pos, 0);
        assert_eq!(cli.msg_or_dir, "msg-001");
        assert_eq!(cli.retries, Some(5));
        assert!(cli.temp_toggle);
        assert!(!cli.distributed);
    }

    #[test]
    fn fetch_flags_parse() {
        let cli = WorkerCli::parse_from([
            "fr-fetch", "/var/afd", "0", "1", "3", "inbound", "-d", "-A", "-r",
        ]);
        assert!(cli.distributed);
        assert!(cli.append_only);
        assert!(cli.remove);
    }

    #[test]
    fn mon_args_parse() {
        let cli = MonCli::parse_from(["fr-mon", "-w", "/var/afd"]);
        assert_eq!(cli.work_dir, Some(PathBuf::from("/var/afd")));
        assert!(cli.peer_poll.is_none());
        let cli = MonCli::parse_from(["fr-mon", "--peer-poll", "3"]);
        assert_eq!(cli.peer_poll, Some(3));
    }
}
