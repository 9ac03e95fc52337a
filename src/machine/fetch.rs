//! Retrieve path: reconcile the remote directory with the retrieve list,
//! claim work, and pull claimed files into the local incoming tree.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ProtoError, WorkerError};
use crate::fifo;
use crate::limits::{RateLimiter, TransferTimeout, clock_ticks_per_second};
use crate::machine::{local_final_name, local_temp_name};
use crate::progress::ProgressReporter;
use crate::protocol::{AuthMethod, ConnectTuning, MultiRead, ProtocolAdapter};
use crate::retrieve_list::{RL_SIZE_UNKNOWN, RetrieveList};
use crate::status::fra::{DIR_ERROR_SET, DO_NOT_PARALLELIZE, FraArea, StupidMode};
use crate::status::fsa::{FsaArea, KEEP_TIME_STAMP, TIMEOUT_TRANSFER};

/// How many unclaimed files one scan hands to this worker before hinting
/// for helpers.
pub const FETCH_BATCH: usize = 100;

pub struct FetchOptions {
    pub tuning: ConnectTuning,
    pub block_size: usize,
    /// Resume from the previously seen size instead of the temp file.
    pub append_only: bool,
    /// Delete remote files after retrieval even if the directory says keep.
    pub remove_override: bool,
    /// Helper worker started on the "more files" hint.
    pub distributed: bool,
    pub force_reread: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            tuning: ConnectTuning::default(),
            block_size: 4096,
            append_only: false,
            remove_override: false,
            distributed: false,
            force_reread: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FetchOutcome {
    pub files_retrieved: u32,
    pub bytes_retrieved: u64,
    pub more_files_hint: bool,
    /// Directory was unchanged; nothing was even listed.
    pub unchanged: bool,
}

/// Connection facts parsed out of the directory URL.
pub struct DirSource {
    pub scheme: crate::protocol::Scheme,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl DirSource {
    pub fn parse(url_str: &str) -> Result<Self, WorkerError> {
        let url = url::Url::parse(url_str)
            .map_err(|e| WorkerError::Incorrect(format!("bad directory url: {}", e)))?;
        let scheme = crate::protocol::Scheme::parse(url.scheme())
            .ok_or_else(|| WorkerError::Incorrect(format!("unknown scheme {}", url.scheme())))?;
        Ok(Self {
            scheme,
            user: url.username().to_string(),
            password: url.password().unwrap_or("").to_string(),
            host: url
                .host_str()
                .ok_or_else(|| WorkerError::Incorrect("directory url without host".into()))?
                .to_string(),
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            path: url.path().to_string(),
        })
    }
}

pub struct FetchMachine<'a> {
    pub work_dir: &'a Path,
    pub fsa: &'a FsaArea,
    pub fra: &'a FraArea,
    pub host_pos: usize,
    pub dir_pos: usize,
    pub slot_no: usize,
    /// Home directory remembered after login for burst replays.
    pub home_dir: Option<String>,
}

impl FetchMachine<'_> {
    pub fn establish(
        &mut self,
        adapter: &mut dyn ProtocolAdapter,
        src: &DirSource,
        opts: &FetchOptions,
    ) -> Result<(), WorkerError> {
        let mut tuning = opts.tuning.clone();
        if tuning.port == 0 {
            tuning.port = src.port;
        }
        adapter
            .connect(&src.host, &tuning)
            .map_err(|e| WorkerError::Connect(src.host.clone(), e))?;
        adapter
            .authenticate(&src.user, &src.password, &AuthMethod::Password)
            .map_err(|e| WorkerError::Auth(src.host.clone(), e))?;
        if !opts.distributed {
            // Needed to get back out of the data directory on a burst.
            self.home_dir = adapter.pwd().ok();
        }
        Ok(())
    }

    fn incoming_dir(&self, dir_alias: &str) -> PathBuf {
        self.work_dir.join("incoming").join(dir_alias)
    }

    /// Reconcile the remote listing into the retrieve list and claim a
    /// batch for this slot. Returns the fresh directory mtime and whether
    /// more unclaimed files remain.
    fn scan_and_claim(
        &self,
        adapter: &mut dyn ProtocolAdapter,
        rl: &mut RetrieveList,
    ) -> Result<(i64, bool), WorkerError> {
        let names = adapter
            .list_names(None)
            .map_err(|e| WorkerError::ReadRemote("directory listing".into(), e))?;
        let now = chrono::Utc::now().timestamp();

        // Everything drops out of the listing until re-observed.
        for i in 0..rl.len() {
            if let Ok(e) = rl.entry_mut(i) {
                e.in_list = 0;
            }
        }

        for name in &names {
            if name == "." || name == ".." {
                continue;
            }
            let st = match adapter.stat(name) {
                Ok(st) => st,
                Err(ProtoError::NoSuchFile) => continue,
                Err(e) => return Err(WorkerError::StatTarget(name.clone(), e)),
            };
            let size = st.size.map(|s| s as i64).unwrap_or(RL_SIZE_UNKNOWN);
            let mtime = st.mtime.unwrap_or(0);
            match rl.find(name) {
                Some(i) => {
                    let e = rl.entry_mut(i).map_err(|e| WorkerError::Incorrect(e.to_string()))?;
                    e.in_list = 1;
                    if e.retrieved != 0 && (e.size != size || e.file_mtime != mtime) {
                        // Replaced upstream; fetch it again.
                        e.prev_size = e.size;
                        e.size = size;
                        e.file_mtime = mtime;
                        e.retrieved = 0;
                    } else if e.retrieved == 0 {
                        e.prev_size = e.size;
                        e.size = size;
                        e.file_mtime = mtime;
                    }
                }
                None => {
                    rl.push(name, size, mtime, now)
                        .map_err(|e| WorkerError::Incorrect(e.to_string()))?;
                }
            }
        }

        // Claim up to a batch of free entries for this slot.
        let mut claimed = 0usize;
        let mut more = false;
        for i in 0..rl.len() {
            let e = *rl.entry(i).map_err(|e| WorkerError::Incorrect(e.to_string()))?;
            if e.retrieved != 0 || e.in_list == 0 || e.assigned != 0 {
                continue;
            }
            if claimed >= FETCH_BATCH {
                more = true;
                break;
            }
            if rl.claim(i, self.slot_no).is_ok() {
                claimed += 1;
            }
        }

        let dir_mtime = adapter
            .stat(".")
            .ok()
            .and_then(|st| st.mtime)
            .unwrap_or(0);
        Ok((dir_mtime, more))
    }

    /// Run one retrieve job over an established connection.
    pub fn run_job(
        &mut self,
        adapter: &mut dyn ProtocolAdapter,
        rl: &mut RetrieveList,
        opts: &FetchOptions,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<FetchOutcome, WorkerError> {
        let dir = self.fra.dir(self.dir_pos);
        let dir_alias = dir.alias().to_string();
        let dir_path = {
            let src = DirSource::parse(dir.url())?;
            src.path
        };
        let remove_after = dir.remove != 0 || opts.remove_override;
        let force = dir.force_reread != 0 || opts.force_reread;
        let old_mtime = dir.dir_mtime;
        let no_parallel = dir.dir_flag & DO_NOT_PARALLELIZE != 0;
        let append_only = opts.append_only || dir.stupid_mode() == StupidMode::AppendOnly;

        let host = self.fsa.host(self.host_pos);
        let trl = host.trl_per_process;
        let timeout_secs =
            if host.has_option(TIMEOUT_TRANSFER) { host.transfer_timeout } else { 0 };
        let keep_mtime = host.has_option(KEEP_TIME_STAMP);

        adapter
            .cd(&dir_path, false, 0)
            .map_err(|e| WorkerError::Chdir(dir_path.clone(), e))?;

        // Unchanged directory and nothing forcing a re-read: report 0/0 and
        // leave the rest to the burst probe.
        let probe_mtime = adapter.stat(".").ok().and_then(|st| st.mtime);
        if !force
            && let Some(mt) = probe_mtime
            && mt == old_mtime
        {
            tracing::info!(dir = %dir_alias, "directory unchanged, 0 files 0 bytes");
            self.clear_dir_error_state();
            return Ok(FetchOutcome { unchanged: true, ..Default::default() });
        }

        let (new_mtime, more) = self.scan_and_claim(adapter, rl)?;
        if more && !no_parallel && !opts.distributed {
            // Plenty left; ask the dispatcher for helpers.
            fifo::wake_dispatcher(self.work_dir);
        }

        let incoming = self.incoming_dir(&dir_alias);
        std::fs::create_dir_all(&incoming)
            .map_err(|e| WorkerError::WriteLocal(incoming.display().to_string(), e.to_string()))?;

        let clk = clock_ticks_per_second();
        let mut limiter = RateLimiter::init();
        let mut guard = TransferTimeout::new(timeout_secs);
        let mut outcome = FetchOutcome { more_files_hint: more, ..Default::default() };

        let work = rl.claimed_by(self.slot_no);
        for i in work {
            if let Some(e) = crate::worker::interrupted() {
                return Err(e);
            }
            let entry = *rl.entry(i).map_err(|e| WorkerError::Incorrect(e.to_string()))?;
            let remote_name = entry.file_name().to_string();
            let listed_size = if entry.size >= 0 { entry.size as u64 } else { 0 };

            let temp_path = incoming.join(local_temp_name(&remote_name));
            let mut offset = match std::fs::metadata(&temp_path) {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            if offset == 0 && append_only && entry.prev_size > 0 {
                offset = entry.prev_size as u64;
            }

            match adapter.open_read(&remote_name, offset) {
                Ok(()) => {}
                Err(ProtoError::NoSuchFile) => {
                    // Vanished between listing and open; non-fatal skip.
                    tracing::info!(file = %remote_name, "gone on remote, skipped");
                    if let Ok(e) = rl.entry_mut(i) {
                        e.in_list = 0;
                    }
                    reporter.discard_file(listed_size)?;
                    let _ = rl.release(i);
                    continue;
                }
                Err(e) => return Err(WorkerError::OpenRemote(remote_name, e)),
            }

            let mut local = std::fs::OpenOptions::new()
                .create(true)
                .append(offset > 0)
                .write(true)
                .truncate(offset == 0)
                .open(&temp_path)
                .map_err(|e| WorkerError::OpenLocal(temp_path.display().to_string(), e.to_string()))?;

            reporter.begin_file(&remote_name, listed_size);
            guard.start_file();
            let mut got = 0u64;

            let stream_result: Result<(), WorkerError> = if adapter.supports_multi_read() {
                let mut mr = MultiRead::init(4, opts.block_size);
                loop {
                    if guard.exceeded() {
                        break Err(WorkerError::StillFilesToSend);
                    }
                    match mr.catch(adapter) {
                        Ok(Some(block)) => {
                            local.write_all(&block).map_err(|e| {
                                WorkerError::WriteLocal(
                                    temp_path.display().to_string(),
                                    e.to_string(),
                                )
                            })?;
                            got += block.len() as u64;
                            reporter.add_bytes(block.len() as u64)?;
                            limiter.tick(block.len() as u64, trl, clk);
                        }
                        Ok(None) => break Ok(()),
                        Err(e) if !mr.is_single_reads() => {
                            // Window rejected; drain and fall back.
                            tracing::debug!("read window failed ({}), single reads", e);
                            mr.discard();
                        }
                        Err(e) => break Err(WorkerError::ReadRemote(remote_name.clone(), e)),
                    }
                }
            } else {
                let mut buf = vec![0u8; opts.block_size];
                loop {
                    if guard.exceeded() {
                        break Err(WorkerError::StillFilesToSend);
                    }
                    match adapter.read(&mut buf) {
                        Ok(0) => break Ok(()),
                        Ok(n) => {
                            local.write_all(&buf[..n]).map_err(|e| {
                                WorkerError::WriteLocal(
                                    temp_path.display().to_string(),
                                    e.to_string(),
                                )
                            })?;
                            got += n as u64;
                            reporter.add_bytes(n as u64)?;
                            limiter.tick(n as u64, trl, clk);
                        }
                        Err(e) => break Err(WorkerError::ReadRemote(remote_name.clone(), e)),
                    }
                }
            };

            if let Err(e) = stream_result {
                reporter.fail_file()?;
                let _ = adapter.close();
                let _ = rl.release(i);
                return Err(e);
            }

            adapter
                .close()
                .map_err(|e| WorkerError::CloseRemote(remote_name.clone(), e))?;

            if keep_mtime
                && let Some(mt) = adapter.stat(&remote_name).ok().and_then(|st| st.mtime).or({
                    if entry.file_mtime > 0 { Some(entry.file_mtime) } else { None }
                })
                && mt > 0
            {
                let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(mt as u64);
                let _ = local.set_modified(when);
            }
            drop(local);

            if remove_after && let Err(e) = adapter.delete(&remote_name) {
                tracing::warn!(file = %remote_name, "remote delete failed: {}", e);
            }

            let final_path = incoming.join(local_final_name(&remote_name));
            std::fs::rename(&temp_path, &final_path).map_err(|e| {
                WorkerError::WriteLocal(final_path.display().to_string(), e.to_string())
            })?;

            rl.mark_retrieved(i).map_err(|e| WorkerError::Incorrect(e.to_string()))?;
            let total_got = offset + got;
            reporter.finish_file(got)?;
            reporter.clear_error_state(self.work_dir)?;
            outcome.files_retrieved += 1;
            outcome.bytes_retrieved += got;
            fifo::send_log_record(
                self.work_dir,
                fifo::RECEIVE_LOG_FIFO,
                &format!("normal-received|{}|{}|{}", dir_alias, remote_name, total_got),
            );
            tracing::info!(dir = %dir_alias, file = %remote_name, bytes = total_got, "received");
        }

        if outcome.files_retrieved == 0 {
            self.clear_dir_error_state();
            fifo::wake_dispatcher(self.work_dir);
        }

        // Roll the stamp back one second so same-second changes are caught
        // by the next scan.
        if new_mtime > 0 {
            self.fra.dir_mut(self.dir_pos).dir_mtime = new_mtime - 1;
        }

        Ok(outcome)
    }

    fn clear_dir_error_state(&self) {
        if let Ok(_ec) = self.fra.lock_ec(self.dir_pos) {
            let dir = self.fra.dir_mut(self.dir_pos);
            dir.error_counter = 0;
            dir.dir_flag &= !DIR_ERROR_SET;
        }
    }

    /// Exit-path cleanup for retrieve workers: every claim this slot still
    /// holds is released, and one-shot directories forget their listing.
    pub fn cleanup_claims(&self, rl: RetrieveList) {
        rl.release_all_for_slot(self.slot_no);
        let preserve = !self.fra.dir(self.dir_pos).forgets_listings();
        if let Err(e) = rl.detach(preserve) {
            tracing::warn!("retrieve list detach failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::mock::MockAdapter;
    use crate::status::fra::FraArea;
    use crate::status::fsa::FsaArea;

    struct Fixture {
        dir: tempfile::TempDir,
        fsa: FsaArea,
        fra: FraArea,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        {
            let h = fsa.host_mut(0);
            h.set_alias("peer");
            h.set_hostnames("peer.example", None);
        }
        let fra = FraArea::create(dir.path(), 1, 1).unwrap();
        {
            let d = fra.dir_mut(0);
            d.set_alias("inbound");
            d.set_url("sftp://afd:x@peer.example//data/out");
        }
        Fixture { dir, fsa, fra }
    }

    fn machine<'a>(fx: &'a Fixture) -> FetchMachine<'a> {
        FetchMachine {
            work_dir: fx.dir.path(),
            fsa: &fx.fsa,
            fra: &fx.fra,
            host_pos: 0,
            dir_pos: 0,
            slot_no: 0,
            home_dir: None,
        }
    }

    #[test]
    fn dir_source_parses_url() {
        let src = DirSource::parse("sftp://u:pw@h.example:2222/data/in").unwrap();
        assert_eq!(src.scheme, crate::protocol::Scheme::Sftp);
        assert_eq!(src.user, "u");
        assert_eq!(src.password, "pw");
        assert_eq!(src.port, 2222);
        assert_eq!(src.path, "/data/in");
        let src = DirSource::parse("ftp://u@h.example/x").unwrap();
        assert_eq!(src.port, 21);
    }

    #[test]
    fn retrieves_listed_files() {
        let fx = fixture();
        let mut adapter = MockAdapter::with_files(&[("a.dat", b"alpha"), ("b.dat", b"bravo!")]);
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        // Outstanding totals as the scanner would have charged them.
        {
            let h = fx.fsa.host_mut(0);
            h.total_file_counter = 2;
            h.total_file_size = 11;
        }
        let out = m
            .run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_retrieved, 2);
        assert_eq!(out.bytes_retrieved, 11);
        let incoming = fx.dir.path().join("incoming/inbound");
        assert_eq!(std::fs::read(incoming.join("a.dat")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(incoming.join("b.dat")).unwrap(), b"bravo!");
        // Both entries retrieved and unassigned.
        for i in 0..rl.len() {
            let e = rl.entry(i).unwrap();
            assert_eq!(e.retrieved, 1);
            assert_eq!(e.assigned, 0);
        }
    }

    #[test]
    fn vanished_file_is_skipped_not_fatal() {
        let fx = fixture();
        let mut adapter = MockAdapter::with_files(&[("keep.dat", b"k"), ("gone.dat", b"g")]);
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        {
            let h = fx.fsa.host_mut(0);
            h.total_file_counter = 2;
            h.total_file_size = 2;
        }
        // Scan first so both files are claimed, then remove one remotely.
        let mut m = machine(&fx);
        let (_, _) = m.scan_and_claim(&mut adapter, &mut rl).unwrap();
        adapter.files.remove("gone.dat");
        adapter.read_buf = None;
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let out = m
            .run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_retrieved, 1);
        let gone = rl.find("gone.dat").unwrap();
        assert_eq!(rl.entry(gone).unwrap().in_list, 0);
        assert_eq!(rl.entry(gone).unwrap().assigned, 0);
    }

    #[test]
    fn temp_resume_appends_from_offset() {
        let fx = fixture();
        let mut adapter = MockAdapter::with_files(&[("r.bin", b"0123456789")]);
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        let incoming = fx.dir.path().join("incoming/inbound");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(incoming.join(".r.bin"), b"0123").unwrap();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        {
            let h = fx.fsa.host_mut(0);
            h.total_file_counter = 1;
            h.total_file_size = 10;
        }
        let out = m
            .run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(out.files_retrieved, 1);
        assert_eq!(out.bytes_retrieved, 6);
        assert_eq!(
            std::fs::read(incoming.join("r.bin")).unwrap(),
            b"0123456789"
        );
    }

    #[test]
    fn remove_flag_deletes_remote_after_fetch() {
        let fx = fixture();
        fx.fra.dir_mut(0).remove = 1;
        let mut adapter = MockAdapter::with_files(&[("x.dat", b"x")]);
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        {
            let h = fx.fsa.host_mut(0);
            h.total_file_counter = 1;
            h.total_file_size = 1;
        }
        m.run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert!(adapter.files.is_empty());
    }

    #[test]
    fn unchanged_directory_short_circuits() {
        let fx = fixture();
        let mut adapter = MockAdapter::with_files(&[(".", b"dir"), ("f.dat", b"y")]);
        // Mock stat answers mtime 1_700_000_000 for known paths.
        fx.fra.dir_mut(0).dir_mtime = 1_700_000_000;
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        let out = m
            .run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert!(out.unchanged);
        assert_eq!(rl.len(), 0);
    }

    #[test]
    fn dir_mtime_rolls_back_one_second() {
        let fx = fixture();
        let mut adapter = MockAdapter::with_files(&[(".", b"dir"), ("f.dat", b"y")]);
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        let mut m = machine(&fx);
        let mut rep = ProgressReporter::new(&fx.fsa, 0, 0);
        {
            let h = fx.fsa.host_mut(0);
            h.total_file_counter = 1;
            h.total_file_size = 1;
        }
        m.run_job(&mut adapter, &mut rl, &FetchOptions::default(), &mut rep)
            .unwrap();
        assert_eq!(fx.fra.dir(0).dir_mtime, 1_700_000_000 - 1);
    }

    #[test]
    fn cleanup_releases_claims_and_honors_policy() {
        let fx = fixture();
        let mut rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        rl.push("a", 1, 0, 0).unwrap();
        rl.claim(0, 0).unwrap();
        let m = machine(&fx);
        let path = rl.path().to_path_buf();
        m.cleanup_claims(rl);
        // Remember policy keeps the file, with the claim released.
        assert!(path.exists());
        let rl = RetrieveList::attach(fx.dir.path(), "inbound").unwrap();
        assert_eq!(rl.entry(0).unwrap().assigned, 0);
        // One-shot policy discards it.
        fx.fra.dir_mut(0).stupid_mode = StupidMode::Forget as u8;
        let m = machine(&fx);
        m.cleanup_claims(rl);
        assert!(!path.exists());
    }
}
