//! Send path: deliver every file in the job's spool directory to the
//! remote, with append resume, temp-name locking, optional framing and
//! deterministic counter reconciliation on each outcome.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::dupcheck;
use crate::error::{ProtoError, WorkerError};
use crate::job::{JobDescriptor, LockStrategy, RenameRules, RuleScope};
use crate::limits::{RateLimiter, TransferTimeout, clock_ticks_per_second};
use crate::machine::{AsciiBuffer, WMO_FOOTER, on_wire_name, probe_append_offset, wmo_frame_prefix};
use crate::progress::ProgressReporter;
use crate::protocol::{ConnectTuning, ProtocolAdapter, TransferMode};
use crate::status::fsa::{
    CHECK_SIZE, FAST_CD, FAST_MOVE, FsaArea, SET_IDLE_TIME, TCP_KEEPALIVE, TIMEOUT_TRANSFER,
    TLS_STRICT_VERIFY,
};
use crate::util::unlink_with_busy_retry;

pub struct SendOptions {
    pub tuning: ConnectTuning,
    pub block_size: usize,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { tuning: ConnectTuning::default(), block_size: 4096 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SendOutcome {
    pub files_sent: u32,
    pub bytes_sent: u64,
    pub appends: u32,
    pub discarded: u32,
}

pub struct SendMachine<'a> {
    pub work_dir: &'a Path,
    pub fsa: &'a FsaArea,
    pub host_pos: usize,
    pub slot_no: usize,
    pub rules: &'a RenameRules,
    pub unique_tag: String,
    pub sequence: u32,
    /// Where login landed us; bursts with a changed target return here.
    pub home_dir: Option<String>,
}

fn classify_auth(host: String, e: ProtoError) -> WorkerError {
    match &e {
        ProtoError::Status(code, msg) => {
            let m = msg.to_ascii_lowercase();
            if m.contains("user") && *code >= 500 {
                WorkerError::User(host, e)
            } else if m.contains("pass") {
                WorkerError::Password(host, e)
            } else {
                WorkerError::Auth(host, e)
            }
        }
        _ => WorkerError::Auth(host, e),
    }
}

impl SendMachine<'_> {
    /// Connect, authenticate and prime the session (transfer type, SITE
    /// hook, idle hint). One call per transport; bursts reuse it.
    pub fn establish(
        &mut self,
        adapter: &mut dyn ProtocolAdapter,
        job: &JobDescriptor,
        opts: &SendOptions,
    ) -> Result<(), WorkerError> {
        let host = self.fsa.host(self.host_pos);
        let hostname = host.hostname().to_string();
        let mut tuning = opts.tuning.clone();
        if tuning.port == 0 {
            tuning.port = job
                .scheme()
                .map(|s| s.default_port())
                .unwrap_or(21);
        }
        tuning.tcp_keepalive = host.has_option(TCP_KEEPALIVE);
        tuning.tls_strict_verify = host.has_option(TLS_STRICT_VERIFY);
        adapter
            .connect(&hostname, &tuning)
            .map_err(|e| WorkerError::Connect(hostname.clone(), e))?;
        adapter
            .authenticate(&job.user, &job.password, &job.auth_method())
            .map_err(|e| classify_auth(hostname.clone(), e))?;
        adapter
            .set_transfer_mode(job.transfer_mode())
            .map_err(|e| WorkerError::TypeSet(hostname.clone(), e))?;
        if let Some(site) = &job.site_pre
            && let Err(e) = adapter.exec_site(site)
        {
            tracing::warn!("SITE {} failed: {}", site, e);
        }
        if host.has_option(SET_IDLE_TIME)
            && let Some(idle) = job.idle_time
            && let Err(e) = adapter.exec_site(&format!("IDLE {}", idle))
        {
            tracing::debug!("idle hint rejected: {}", e);
        }
        self.home_dir = adapter.pwd().ok();
        Ok(())
    }

    /// Rename rule effective for the current hostname toggle. A rule scoped
    /// to the other toggle is disabled for this connection.
    fn effective_rule<'j>(&self, job: &'j JobDescriptor) -> Option<&'j str> {
        let toggle = self.fsa.host(self.host_pos).host_toggle;
        let secondary = toggle == 2;
        match job.rename_rule_scope {
            RuleScope::Both => job.rename_rule.as_deref(),
            RuleScope::PrimaryOnly if !secondary => job.rename_rule.as_deref(),
            RuleScope::SecondaryOnly if secondary => job.rename_rule.as_deref(),
            _ => None,
        }
    }

    fn remote_path(&self, fast_cd: bool, target_dir: &str, name: &str) -> String {
        if fast_cd {
            format!("{}/{}", target_dir.trim_end_matches('/'), name)
        } else {
            name.to_string()
        }
    }

    /// Another slot on the same host already delivering this name?
    fn duplicate_writer(&self, final_name: &str) -> bool {
        let host = self.fsa.host(self.host_pos);
        host.slots
            .iter()
            .enumerate()
            .any(|(i, s)| i != self.slot_no && s.file_name_in_use() == final_name)
    }

    fn spool_entries(spool: &Path) -> Result<Vec<(PathBuf, u64, i64)>, WorkerError> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(spool).min_depth(1).max_depth(1) {
            let entry = entry
                .map_err(|e| WorkerError::OpenLocal(spool.display().to_string(), e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| WorkerError::OpenLocal(spool.display().to_string(), e.to_string()))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            entries.push((entry.into_path(), meta.len(), mtime));
        }
        entries.sort();
        Ok(entries)
    }

    fn archive_local(&self, job: &JobDescriptor, local: &Path, final_name: &str) -> std::io::Result<()> {
        let date = chrono::Local::now().format("%Y%m%d").to_string();
        let dir = self
            .work_dir
            .join("archive")
            .join(&job.host_alias)
            .join(date);
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(local, dir.join(final_name))?;
        Ok(())
    }

    /// Run one job over an established connection. Returns what was moved;
    /// the caller decides about bursting and QUIT.
    pub fn run_job(
        &mut self,
        adapter: &mut dyn ProtocolAdapter,
        job: &mut JobDescriptor,
        msg_name: &str,
        opts: &SendOptions,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<SendOutcome, WorkerError> {
        let host = self.fsa.host(self.host_pos);
        let fast_cd = host.has_option(FAST_CD);
        let fast_move = host.has_option(FAST_MOVE);
        let check_size = job.check_size || host.has_option(CHECK_SIZE);
        let trl = host.trl_per_process;
        let block_size = if host.block_size > 0 { host.block_size as usize } else { opts.block_size };
        let timeout_secs =
            if host.has_option(TIMEOUT_TRANSFER) { host.transfer_timeout } else { 0 };
        let host_toggle_alias = host.alias().to_string();
        reporter.set_silent_size_drift(job.lock == LockStrategy::OffSilent);

        if !fast_cd {
            adapter
                .cd(&job.target_dir, job.create_target_dir, job.dir_mode)
                .map_err(|e| WorkerError::Chdir(job.target_dir.clone(), e))?;
        }

        // Batch lock file, written before the first transfer.
        let lock_file_path = if let LockStrategy::LockFile(name) = &job.lock {
            let p = self.remote_path(fast_cd, &job.target_dir, name);
            adapter
                .open_write_sized(&p, 0, Some(0))
                .and_then(|_| adapter.close())
                .map_err(|e| WorkerError::WriteLock(p.clone(), e))?;
            Some(p)
        } else {
            None
        };

        let spool = job.spool_dir(self.work_dir, msg_name);
        let entries = Self::spool_entries(&spool)?;
        reporter.set_job(
            job.job_id,
            entries.len() as i32,
            entries.iter().map(|e| e.1).sum(),
        );

        let clk = clock_ticks_per_second();
        let mut limiter = RateLimiter::init();
        let mut guard = TransferTimeout::new(timeout_secs);
        let mut outcome = SendOutcome::default();
        let mut buf = vec![0u8; block_size];
        let now = chrono::Utc::now().timestamp();

        for (local_path, local_size, mtime) in entries {
            if let Some(e) = crate::worker::interrupted() {
                return Err(e);
            }
            let base_name = local_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| WorkerError::Incorrect("spool entry without a name".into()))?;

            // Too old to be worth delivering.
            if job.age_limit_secs > 0 && now - mtime > job.age_limit_secs as i64 {
                tracing::info!("{} older than age limit, discarded", base_name);
                unlink_with_busy_retry(&local_path)
                    .map_err(|e| WorkerError::WriteLocal(base_name.clone(), e.to_string()))?;
                reporter.discard_file(local_size)?;
                outcome.discarded += 1;
                continue;
            }

            let final_name = match self.effective_rule(job) {
                Some(rule) => self.rules.apply(rule, &base_name),
                None => base_name.clone(),
            };

            // Another slot is already writing this name on the same host.
            if self.duplicate_writer(&final_name) {
                tracing::info!("{} already being delivered by a sibling, deleted", final_name);
                unlink_with_busy_retry(&local_path)
                    .map_err(|e| WorkerError::WriteLocal(final_name.clone(), e.to_string()))?;
                crate::fifo::send_log_record(
                    self.work_dir,
                    crate::fifo::TRANSFER_LOG_FIFO,
                    &format!("other-proc-delete|{}|{}", host_toggle_alias, final_name),
                );
                reporter.discard_file(local_size)?;
                outcome.discarded += 1;
                continue;
            }

            // Append resume for files from the restart list.
            let mut append_offset = 0u64;
            if job.in_restart_list(&final_name) && adapter.supports_append_probe() {
                let probe_name = self.remote_path(fast_cd, &job.target_dir, &final_name);
                append_offset = probe_append_offset(
                    adapter,
                    &probe_name,
                    self.fsa.host(self.host_pos).file_size_offset,
                )
                .map_err(|e| WorkerError::StatTarget(probe_name.clone(), e))?;
                if append_offset > local_size {
                    append_offset = 0;
                }
            }

            let mut wire_name =
                on_wire_name(&final_name, &job.lock, &self.unique_tag, self.sequence);
            let mut wire_path = self.remote_path(fast_cd, &job.target_dir, &wire_name);
            reporter.begin_file(&final_name, local_size);

            let mut local = std::fs::File::open(&local_path)
                .map_err(|e| WorkerError::OpenLocal(local_path.display().to_string(), e.to_string()))?;
            if append_offset > 0 {
                local
                    .seek(SeekFrom::Start(append_offset))
                    .map_err(|e| WorkerError::ReadLocal(final_name.clone(), e.to_string()))?;
            }

            let framing = if job.wmo_framing {
                Some(wmo_frame_prefix(&final_name))
            } else {
                None
            };
            let expected_payload = local_size - append_offset;
            let size_hint = Some(
                expected_payload + framing.as_ref().map(|f| f.len() as u64 + 4).unwrap_or(0),
            );

            let open_res = adapter.open_write_sized(&wire_path, append_offset, size_hint);
            if let Err(e) = open_res {
                // A busy reply under sequence locking gets one retry with
                // the next tail.
                let busy = matches!(&e, ProtoError::Status(_, m) if m.to_ascii_lowercase().contains("busy"));
                if busy && job.lock == LockStrategy::Sequence {
                    self.sequence += 1;
                    wire_name =
                        on_wire_name(&final_name, &job.lock, &self.unique_tag, self.sequence);
                    wire_path = self.remote_path(fast_cd, &job.target_dir, &wire_name);
                    adapter
                        .open_write_sized(&wire_path, append_offset, size_hint)
                        .map_err(|e2| WorkerError::OpenRemote(wire_path.clone(), e2))?;
                } else {
                    reporter.fail_file()?;
                    return Err(WorkerError::OpenRemote(wire_path, e));
                }
            }

            guard.start_file();
            let mut wire_bytes = 0u64;
            let mut ascii = matches!(
                job.transfer_mode(),
                TransferMode::Ascii | TransferMode::Dos
            )
            .then(|| AsciiBuffer::new(block_size));

            if let Some(prefix) = &framing {
                adapter
                    .write(prefix)
                    .map_err(|e| WorkerError::WriteRemote(wire_path.clone(), e))?;
                wire_bytes += prefix.len() as u64;
            }

            let stream_result: Result<u64, WorkerError> = loop {
                if guard.exceeded() {
                    tracing::warn!("{} hit the per-file transfer timeout", final_name);
                    break Err(WorkerError::StillFilesToSend);
                }
                let n = match local.read(&mut buf) {
                    Ok(0) => break Ok(wire_bytes),
                    Ok(n) => n,
                    Err(e) => {
                        break Err(WorkerError::ReadLocal(final_name.clone(), e.to_string()));
                    }
                };
                let chunk: &[u8] = match &mut ascii {
                    Some(a) => a.translate(&buf[..n]),
                    None => &buf[..n],
                };
                if let Err(e) = adapter.write(chunk) {
                    break Err(WorkerError::WriteRemote(wire_path.clone(), e));
                }
                wire_bytes += chunk.len() as u64;
                reporter.add_bytes(n as u64)?;
                limiter.tick(n as u64, trl, clk);
            };

            let wire_bytes = match stream_result {
                Ok(b) => b,
                Err(e) => {
                    reporter.fail_file()?;
                    // The transport is gone on EPIPE; do not chat further.
                    if !e.skips_quit() {
                        let _ = adapter.close();
                    }
                    return Err(e);
                }
            };

            let wire_bytes = if framing.is_some() {
                adapter
                    .write(WMO_FOOTER)
                    .map_err(|e| WorkerError::WriteRemote(wire_path.clone(), e))?;
                wire_bytes + WMO_FOOTER.len() as u64
            } else {
                wire_bytes
            };

            adapter
                .close()
                .map_err(|e| WorkerError::CloseRemote(wire_path.clone(), e))?;

            if let Some(mode) = job.chmod
                && let Err(e) = adapter.chmod(&wire_path, mode)
            {
                tracing::warn!("chmod on {} failed: {}", wire_path, e);
            }

            if check_size {
                let st = adapter
                    .stat(&wire_path)
                    .map_err(|e| WorkerError::StatTarget(wire_path.clone(), e))?;
                let expected = append_offset + wire_bytes;
                if let Some(remote_size) = st.size
                    && remote_size != expected
                {
                    if job.dupcheck {
                        let _ = dupcheck::remove(self.work_dir, &job.host_alias, &final_name);
                    }
                    reporter.fail_file()?;
                    return Err(WorkerError::SizeMismatch {
                        file: final_name,
                        expected,
                        got: remote_size,
                    });
                }
            }

            if job.lock.needs_rename() {
                let final_path = self.remote_path(fast_cd, &job.target_dir, &final_name);
                // Fast-move hosts create missing target components during
                // the rename instead of a separate navigation round trip.
                adapter
                    .move_file(
                        &wire_path,
                        &final_path,
                        job.create_target_dir || fast_move,
                        job.dir_mode,
                    )
                    .map_err(|e| WorkerError::MoveRemote(wire_path.clone(), final_path.clone(), e))?;
            }

            if let Some(suffix) = &job.ready_file_suffix {
                let ready = self
                    .remote_path(fast_cd, &job.target_dir, &format!("{}{}", final_name, suffix));
                let body = final_name.as_bytes();
                adapter
                    .open_write_sized(&ready, 0, Some(body.len() as u64))
                    .and_then(|_| adapter.write(body))
                    .and_then(|_| adapter.close())
                    .map_err(|e| WorkerError::WriteRemote(ready.clone(), e))?;
            }

            if let Some(site) = &job.site_post
                && let Err(e) = adapter.exec_site(site)
            {
                tracing::warn!("SITE {} failed: {}", site, e);
            }

            if job.archive {
                self.archive_local(job, &local_path, &final_name).map_err(|e| {
                    WorkerError::WriteLocal(final_name.clone(), e.to_string())
                })?;
            }
            drop(local);
            unlink_with_busy_retry(&local_path)
                .map_err(|e| WorkerError::WriteLocal(final_name.clone(), e.to_string()))?;

            if job.dupcheck {
                let _ = dupcheck::add(self.work_dir, &job.host_alias, &final_name);
            }

            if job.in_restart_list(&final_name) {
                job.remove_restart_name(&final_name)
                    .map_err(|e| WorkerError::Incorrect(e.to_string()))?;
                outcome.appends += 1;
            }

            let payload = expected_payload;
            reporter.finish_file(payload)?;
            reporter.clear_error_state(self.work_dir)?;
            outcome.files_sent += 1;
            outcome.bytes_sent += payload;
            crate::fifo::send_log_record(
                self.work_dir,
                crate::fifo::TRANSFER_LOG_FIFO,
                &format!("normal-send|{}|{}|{}", host_toggle_alias, final_name, payload),
            );
            tracing::info!(host = %host_toggle_alias, file = %final_name, bytes = payload, "sent");
        }

        if let Some(lock_path) = lock_file_path {
            adapter
                .delete(&lock_path)
                .map_err(|e| WorkerError::RemoveLockfile(lock_path.clone(), e))?;
        }

        // Restart entries with no matching spool file are stale leftovers.
        if !job.restart_names.is_empty() {
            job.restart_names.clear();
            job.save().map_err(|e| WorkerError::Incorrect(e.to_string()))?;
        }

        if let Err(e) = std::fs::remove_dir(&spool) {
            tracing::warn!("spool {} not removable: {}", spool.display(), e);
            return Err(WorkerError::StillFilesToSend);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RenameRule;
    use crate::machine::mock::{Call, MockAdapter};
    use crate::status::fsa::FsaArea;

    fn msg(extra: serde_json::Value) -> serde_json::Value {
        let mut base = serde_json::json!({
            "job_id": 1,
            "host_alias": "alpha",
            "scheme": "sftp",
            "user": "afd",
            "target_dir": "/in"
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        base
    }

    struct Fixture {
        dir: tempfile::TempDir,
        fsa: FsaArea,
        rules: RenameRules,
    }

    fn fixture(files: &[(&str, &[u8])], extra: serde_json::Value) -> (Fixture, JobDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("msg");
        std::fs::create_dir_all(&msg_dir).unwrap();
        std::fs::write(
            msg_dir.join("job1"),
            serde_json::to_string(&msg(extra)).unwrap(),
        )
        .unwrap();
        let spool = dir.path().join("outgoing").join("job1");
        std::fs::create_dir_all(&spool).unwrap();
        let mut total = 0u64;
        for (name, data) in files {
            std::fs::write(spool.join(name), data).unwrap();
            total += data.len() as u64;
        }
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        {
            let h = fsa.host_mut(0);
            h.set_alias("alpha");
            h.set_hostnames("alpha.example", None);
            h.host_toggle = 1;
            h.total_file_counter = files.len() as i32;
            h.total_file_size = total;
        }
        let job = JobDescriptor::load(dir.path(), "job1").unwrap();
        (Fixture { dir, fsa, rules: RenameRules::default() }, job)
    }

    fn machine<'a>(fx: &'a Fixture) -> SendMachine<'a> {
        SendMachine {
            work_dir: fx.dir.path(),
            fsa: &fx.fsa,
            host_pos: 0,
            slot_no: 0,
            rules: &fx.rules,
            unique_tag: "u1".into(),
            sequence: 0,
            home_dir: None,
        }
    }

    #[test]
    fn plain_send_delivers_and_empties_spool() {
        let (fx, mut job) =
            fixture(&[("a.dat", b"hello"), ("b.dat", b"world!")], serde_json::json!({}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.establish(&mut adapter, &job, &SendOptions::default()).unwrap();
        let out = m
            .run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_sent, 2);
        assert_eq!(out.bytes_sent, 11);
        assert_eq!(adapter.files.get("a.dat").unwrap(), b"hello");
        assert_eq!(adapter.files.get("b.dat").unwrap(), b"world!");
        assert!(!fx.dir.path().join("outgoing/job1").exists());
        let host = fx.fsa.host(0);
        assert_eq!(host.total_file_counter, 0);
        assert_eq!(host.total_file_size, 0);
        assert_eq!(host.slots[0].no_of_files_done, 2);
    }

    #[test]
    fn dot_lock_renames_at_completion() {
        let (fx, mut job) =
            fixture(&[("f.txt", b"data")], serde_json::json!({"lock": {"kind": "dot"}}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert!(adapter.files.contains_key("f.txt"));
        assert!(!adapter.files.contains_key(".f.txt"));
        assert!(adapter
            .calls
            .iter()
            .any(|c| *c == Call::Move(".f.txt".into(), "f.txt".into())));
    }

    #[test]
    fn append_resume_streams_only_the_tail() {
        let payload = vec![7u8; 1000];
        let (fx, mut job) = fixture(
            &[("a.bin", &payload)],
            serde_json::json!({"restart_list": ["a.bin"]}),
        );
        let mut adapter = MockAdapter::with_files(&[("a.bin", &payload[..600])]);
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let out = m
            .run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_sent, 1);
        assert_eq!(out.appends, 1);
        assert_eq!(out.bytes_sent, 400);
        assert!(adapter
            .calls
            .iter()
            .any(|c| *c == Call::OpenWrite("a.bin".into(), 600)));
        assert_eq!(adapter.files.get("a.bin").unwrap().len(), 1000);
        // Restart list shrank and was persisted.
        let again = JobDescriptor::load(fx.dir.path(), "job1").unwrap();
        assert!(again.restart_names.is_empty());
        assert_eq!(fx.fsa.host(0).slots[0].file_size_done, 400);
    }

    #[test]
    fn sibling_writer_discards_local_copy() {
        let (fx, mut job) = fixture(&[("dup.dat", b"abc")], serde_json::json!({}));
        fx.fsa.host_mut(0).slots[1].set_file_name_in_use("dup.dat");
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let out = m
            .run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_sent, 0);
        assert_eq!(out.discarded, 1);
        assert!(!adapter.files.contains_key("dup.dat"));
        assert_eq!(fx.fsa.host(0).total_file_counter, 0);
    }

    #[test]
    fn age_limit_discards_old_files() {
        let (fx, mut job) = fixture(&[("old.dat", b"x")], serde_json::json!({"age_limit_secs": 60}));
        // Spool file mtime is "now"; shrink the limit by aging the clock
        // instead: set mtime far in the past.
        let p = fx.dir.path().join("outgoing/job1/old.dat");
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = std::fs::File::options().write(true).open(&p).unwrap();
        f.set_modified(past).unwrap();
        drop(f);
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let out = m
            .run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.discarded, 1);
        assert!(adapter.files.is_empty());
    }

    #[test]
    fn wmo_framing_wraps_payload() {
        let (fx, mut job) =
            fixture(&[("AB_CD.txt", b"data")], serde_json::json!({"wmo_framing": true}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        let sent = adapter.files.get("AB_CD.txt").unwrap();
        assert!(sent.starts_with(b"\x01\r\r\nAB CD\r\r\n"));
        assert!(sent.ends_with(b"data\r\r\n\x03"));
    }

    #[test]
    fn rename_rule_changes_remote_name() {
        let (mut fx, mut job) = fixture(
            &[("raw_report.tmp", b"r")],
            serde_json::json!({"rename_rule": "wx"}),
        );
        fx.rules.insert(
            "wx",
            vec![RenameRule { pattern: r"^raw_(.*)\.tmp$".into(), replacement: "$1".into() }],
        );
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert!(adapter.files.contains_key("report"));
    }

    #[test]
    fn lock_file_written_and_removed() {
        let (fx, mut job) = fixture(
            &[("f", b"x")],
            serde_json::json!({"lock": {"kind": "lock_file", "arg": "LCK.batch"}}),
        );
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert!(adapter.calls.iter().any(|c| *c == Call::OpenWrite("LCK.batch".into(), 0)));
        assert!(adapter.calls.iter().any(|c| *c == Call::Delete("LCK.batch".into())));
        assert!(!adapter.files.contains_key("LCK.batch"));
    }

    #[test]
    fn busy_reply_retries_with_next_sequence() {
        let (fx, mut job) =
            fixture(&[("s.dat", b"x")], serde_json::json!({"lock": {"kind": "sequence"}}));
        let mut adapter = MockAdapter::default();
        adapter.busy_once = Some("s.dat-0".into());
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert!(adapter.calls.iter().any(|c| *c == Call::OpenWrite("s.dat-1".into(), 0)));
        assert!(adapter.files.contains_key("s.dat"));
    }

    #[test]
    fn ready_file_follows_the_payload() {
        let (fx, mut job) =
            fixture(&[("d.bin", b"z")], serde_json::json!({"ready_file_suffix": ".rdy"}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(adapter.files.get("d.bin.rdy").unwrap(), b"d.bin");
    }

    #[test]
    fn archive_keeps_a_copy() {
        let (fx, mut job) = fixture(&[("k.dat", b"keep")], serde_json::json!({"archive": true}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        let date = chrono::Local::now().format("%Y%m%d").to_string();
        let archived = fx.dir.path().join("archive/alpha").join(date).join("k.dat");
        assert_eq!(std::fs::read(archived).unwrap(), b"keep");
    }

    #[test]
    fn size_mismatch_fails_and_drops_dupcheck_entry() {
        let (fx, mut job) = fixture(
            &[("c.bin", b"12345")],
            serde_json::json!({"check_size": true, "dupcheck": true}),
        );
        crate::dupcheck::add(fx.dir.path(), "alpha", "c.bin").unwrap();
        let mut adapter = MockAdapter::default();
        adapter.stat_lie = Some(3);
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let err = m
            .run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap_err();
        assert!(matches!(err, WorkerError::SizeMismatch { expected: 5, got: 3, .. }));
        assert!(!crate::dupcheck::contains(fx.dir.path(), "alpha", "c.bin"));
        // Slot counters restored by the rollback.
        let slot = &fx.fsa.host(0).slots[0];
        assert_eq!(slot.no_of_files_done, 0);
        assert_eq!(slot.bytes_send, 0);
    }

    #[test]
    fn ascii_mode_translates_line_ends() {
        let (fx, mut job) =
            fixture(&[("t.txt", b"a\nb\n")], serde_json::json!({"transfer_mode": "ascii"}));
        let mut adapter = MockAdapter::default();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        m.run_job(&mut adapter, &mut job, "job1", &SendOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(adapter.files.get("t.txt").unwrap(), b"a\r\nb\r\n");
    }
}
