//! Connection bursting: after a job finishes, ask the dispatcher for
//! another job on the same host and replay only the session transitions
//! whose inputs changed.

use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{ProtoError, WorkerError};
use crate::fifo;
use crate::job::JobDescriptor;
use crate::machine::send::{SendMachine, SendOptions};
use crate::protocol::ProtocolAdapter;

// values_changed bits in a burst reply.
pub const USER_CHANGED: u32 = 1 << 0;
pub const AUTH_CHANGED: u32 = 1 << 1;
pub const TYPE_CHANGED: u32 = 1 << 2;
pub const TARGET_DIR_CHANGED: u32 = 1 << 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstReply {
    /// Another job for this host; the bits say which tuple fields moved.
    Yes { values_changed: u32, msg_name: String },
    /// Retrieve worker should rescan its source directory.
    RescanSource,
    /// Nothing queued; disconnect normally.
    No,
    /// Files remain queued elsewhere; exit so the dispatcher requeues.
    Neither,
}

fn burst_request_fifo(work_dir: &Path) -> std::path::PathBuf {
    work_dir.join("fifo/fd_burst_req.fifo")
}

fn burst_reply_fifo(work_dir: &Path, job_no: usize) -> std::path::PathBuf {
    work_dir.join(format!("fifo/burst_{}.fifo", job_no))
}

/// Ask the dispatcher whether a compatible job is queued. The request names
/// our slot and host; the reply comes back on the per-slot FIFO. A silent
/// dispatcher within `timeout` counts as `No`.
pub fn check_burst(
    work_dir: &Path,
    job_no: usize,
    host_alias: &str,
    timeout: Duration,
) -> std::io::Result<BurstReply> {
    let reply_path = burst_reply_fifo(work_dir, job_no);
    fifo::ensure_fifo(&reply_path)?;
    let mut reply = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&reply_path)?;

    let req_path = burst_request_fifo(work_dir);
    match fifo::open_writer(&req_path) {
        Some(mut w) => {
            use std::io::Write;
            writeln!(w, "{} {}", job_no, host_alias)?;
        }
        // No dispatcher listening; nothing to burst.
        None => return Ok(BurstReply::No),
    }

    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match reply.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                line.extend_from_slice(&buf[..n]);
                if line.contains(&b'\n') {
                    break;
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Ok(BurstReply::No);
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let text = String::from_utf8_lossy(&line);
    let text = text.trim();
    let mut parts = text.split_whitespace();
    Ok(match parts.next() {
        Some("Y") => {
            let values_changed = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let msg_name = parts.next().unwrap_or_default().to_string();
            BurstReply::Yes { values_changed, msg_name }
        }
        Some("R") => BurstReply::RescanSource,
        Some("X") => BurstReply::Neither,
        _ => BurstReply::No,
    })
}

/// Tracks connection age for the keep-connected / disconnect ceilings.
pub struct BurstController {
    connected_at: Instant,
    pub bursts: u64,
}

impl BurstController {
    pub fn new() -> Self {
        Self { connected_at: Instant::now(), bursts: 0 }
    }

    #[cfg(test)]
    fn aged(secs: u64) -> Self {
        Self { connected_at: Instant::now() - Duration::from_secs(secs), bursts: 0 }
    }

    /// Whether the transport is past its allowed lifetime and must close
    /// instead of bursting.
    pub fn should_disconnect(
        &self,
        keep_connected_disconnect: bool,
        keep_connected: u32,
        disconnect_after: u32,
    ) -> bool {
        let diff = self.connected_at.elapsed().as_secs();
        if keep_connected_disconnect && keep_connected > 0 && diff > keep_connected as u64 {
            return true;
        }
        disconnect_after > 0 && diff > disconnect_after as u64
    }
}

impl Default for BurstController {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay the session transitions a new job invalidates. Only the changed
/// pieces are re-issued; an unchanged tuple keeps the session exactly as it
/// is. A rejected fresh login gets one quit-reconnect-retry, never more.
pub fn apply_burst(
    adapter: &mut dyn ProtocolAdapter,
    machine: &mut SendMachine<'_>,
    new_job: &JobDescriptor,
    values_changed: u32,
    opts: &SendOptions,
) -> Result<(), WorkerError> {
    if values_changed & (USER_CHANGED | AUTH_CHANGED) != 0 {
        let host = machine.fsa.host(machine.host_pos).hostname().to_string();
        match adapter.authenticate(&new_job.user, &new_job.password, &new_job.auth_method()) {
            Ok(()) => {}
            Err(ProtoError::Status(code, _)) if code >= 500 => {
                // Some servers reject a second USER outright; reconnect and
                // log in fresh, one attempt only.
                let _ = adapter.quit();
                machine.establish(adapter, new_job, opts)?;
                return Ok(());
            }
            Err(e) => return Err(WorkerError::User(host, e)),
        }
    }
    if values_changed & TYPE_CHANGED != 0 {
        let host = machine.fsa.host(machine.host_pos).hostname().to_string();
        adapter
            .set_transfer_mode(new_job.transfer_mode())
            .map_err(|e| WorkerError::TypeSet(host, e))?;
    }
    if values_changed & TARGET_DIR_CHANGED != 0
        && let Some(home) = &machine.home_dir.clone()
    {
        // Back to where login put us; run_job issues the new cd itself.
        adapter
            .cd(home, false, 0)
            .map_err(|e| WorkerError::Chdir(home.clone(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RenameRules;
    use crate::machine::mock::{Call, MockAdapter};
    use crate::status::fsa::FsaArea;

    fn job_json(dir: &Path, name: &str, user: &str) {
        let msg_dir = dir.join("msg");
        std::fs::create_dir_all(&msg_dir).unwrap();
        std::fs::write(
            msg_dir.join(name),
            serde_json::to_string(&serde_json::json!({
                "job_id": 2,
                "host_alias": "alpha",
                "scheme": "ftp",
                "user": user,
                "target_dir": "/in"
            }))
            .unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn controller_respects_ceilings() {
        let c = BurstController::aged(100);
        assert!(c.should_disconnect(true, 60, 0));
        assert!(!c.should_disconnect(false, 60, 0));
        assert!(c.should_disconnect(false, 0, 90));
        assert!(!c.should_disconnect(false, 0, 0));
        let young = BurstController::new();
        assert!(!young.should_disconnect(true, 60, 90));
    }

    #[test]
    fn check_burst_parses_replies() {
        let dir = tempfile::tempdir().unwrap();
        let req = burst_request_fifo(dir.path());
        let mut req_fifo = fifo::Fifo::open(&req).unwrap();
        // Pre-load the reply so the probe finds it immediately.
        let reply_path = burst_reply_fifo(dir.path(), 3);
        let mut reply_fifo = fifo::Fifo::open(&reply_path).unwrap();
        reply_fifo.send(b"Y 5 msg42\n").unwrap();
        let reply =
            check_burst(dir.path(), 3, "alpha", Duration::from_millis(200)).unwrap();
        assert_eq!(
            reply,
            BurstReply::Yes { values_changed: 5, msg_name: "msg42".into() }
        );
        // The request reached the dispatcher side.
        let req_bytes = req_fifo.drain().unwrap();
        assert_eq!(String::from_utf8_lossy(&req_bytes), "3 alpha\n");

        reply_fifo.send(b"X\n").unwrap();
        assert_eq!(
            check_burst(dir.path(), 3, "alpha", Duration::from_millis(200)).unwrap(),
            BurstReply::Neither
        );
        reply_fifo.send(b"R\n").unwrap();
        assert_eq!(
            check_burst(dir.path(), 3, "alpha", Duration::from_millis(200)).unwrap(),
            BurstReply::RescanSource
        );
    }

    #[test]
    fn check_burst_times_out_to_no() {
        let dir = tempfile::tempdir().unwrap();
        let req = burst_request_fifo(dir.path());
        let _req_fifo = fifo::Fifo::open(&req).unwrap();
        let reply = check_burst(dir.path(), 1, "alpha", Duration::from_millis(50)).unwrap();
        assert_eq!(reply, BurstReply::No);
    }

    #[test]
    fn check_burst_without_dispatcher_is_no() {
        let dir = tempfile::tempdir().unwrap();
        let reply = check_burst(dir.path(), 1, "alpha", Duration::from_millis(50)).unwrap();
        assert_eq!(reply, BurstReply::No);
    }

    fn send_fixture() -> (tempfile::TempDir, FsaArea, RenameRules) {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        {
            let h = fsa.host_mut(0);
            h.set_alias("alpha");
            h.set_hostnames("alpha.example", None);
        }
        (dir, fsa, RenameRules::default())
    }

    #[test]
    fn user_change_relogs_in_place_when_server_allows() {
        let (dir, fsa, rules) = send_fixture();
        job_json(dir.path(), "m2", "u2");
        let job = JobDescriptor::load(dir.path(), "m2").unwrap();
        let mut machine = SendMachine {
            work_dir: dir.path(),
            fsa: &fsa,
            host_pos: 0,
            slot_no: 0,
            rules: &rules,
            unique_tag: "t".into(),
            sequence: 0,
            home_dir: None,
        };
        let mut adapter = MockAdapter::default();
        apply_burst(&mut adapter, &mut machine, &job, USER_CHANGED, &SendOptions::default())
            .unwrap();
        assert_eq!(adapter.calls, vec![Call::Auth("u2".into())]);
    }

    #[test]
    fn user_change_reconnects_once_on_rejection() {
        let (dir, fsa, rules) = send_fixture();
        job_json(dir.path(), "m2", "u2");
        let job = JobDescriptor::load(dir.path(), "m2").unwrap();
        let mut machine = SendMachine {
            work_dir: dir.path(),
            fsa: &fsa,
            host_pos: 0,
            slot_no: 0,
            rules: &rules,
            unique_tag: "t".into(),
            sequence: 0,
            home_dir: None,
        };
        let mut adapter = MockAdapter::default();
        adapter.fail_user_logins = 1;
        apply_burst(&mut adapter, &mut machine, &job, USER_CHANGED, &SendOptions::default())
            .unwrap();
        // Rejected once, then quit + full re-establish.
        assert_eq!(
            adapter.calls,
            vec![
                Call::Auth("u2".into()),
                Call::Quit,
                Call::Connect("alpha.example".into()),
                Call::Auth("u2".into()),
                Call::Mode,
                Call::Pwd,
            ]
        );
    }

    #[test]
    fn type_and_dir_changes_replay_minimal_transitions() {
        let (dir, fsa, rules) = send_fixture();
        job_json(dir.path(), "m3", "u1");
        let job = JobDescriptor::load(dir.path(), "m3").unwrap();
        let mut machine = SendMachine {
            work_dir: dir.path(),
            fsa: &fsa,
            host_pos: 0,
            slot_no: 0,
            rules: &rules,
            unique_tag: "t".into(),
            sequence: 0,
            home_dir: Some("/home/afd".into()),
        };
        let mut adapter = MockAdapter::default();
        apply_burst(
            &mut adapter,
            &mut machine,
            &job,
            TYPE_CHANGED | TARGET_DIR_CHANGED,
            &SendOptions::default(),
        )
        .unwrap();
        assert_eq!(adapter.calls, vec![Call::Mode, Call::Cd("/home/afd".into())]);
    }
}
