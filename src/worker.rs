//! Worker lifecycle: signal wiring, status-area attachment, the burst loop
//! and the cleanup every exit path funnels through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::burst::{BurstController, BurstReply, apply_burst, check_burst};
use crate::cli::WorkerCli;
use crate::error::{WorkerError, WorkerStatus};
use crate::job::{JobDescriptor, RenameRules};
use crate::machine::fetch::{DirSource, FetchMachine, FetchOptions, FetchOutcome};
use crate::machine::send::{SendMachine, SendOptions, SendOutcome};
use crate::progress::ProgressReporter;
use crate::protocol::adapter_for;
use crate::retrieve_list::RetrieveList;
use crate::status::fra::FraArea;
use crate::status::fsa::{ConnectStatus, DISABLE_BURSTING, FsaArea, KEEP_CONNECTED_DISCONNECT, Region};
use crate::util;

static GOT_SIGINT: AtomicBool = AtomicBool::new(false);
static GOT_SIGQUIT: AtomicBool = AtomicBool::new(false);
static MUST_ROLLBACK: AtomicBool = AtomicBool::new(false);

/// How long the burst probe waits for the dispatcher before giving up.
const BURST_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

extern "C" fn on_signal(sig: libc::c_int) {
    // Only flag setting in here; the real cleanup runs on the normal path.
    match sig {
        libc::SIGINT => GOT_SIGINT.store(true, Ordering::SeqCst),
        libc::SIGQUIT => GOT_SIGQUIT.store(true, Ordering::SeqCst),
        libc::SIGSEGV | libc::SIGBUS => {
            MUST_ROLLBACK.store(true, Ordering::SeqCst);
            unsafe {
                libc::signal(sig, libc::SIG_DFL);
                libc::raise(sig);
            }
        }
        _ => {}
    }
}

/// Wire the worker's signal set: INT and QUIT request a clean stop, TERM,
/// HUP and PIPE are ignored (the dispatcher only speaks SIGINT), SEGV and
/// BUS mark the rollback flag and then take the default core dump.
pub fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_signal as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGSEGV, libc::SIGBUS] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
        for sig in [libc::SIGTERM, libc::SIGHUP, libc::SIGPIPE] {
            libc::signal(sig, libc::SIG_IGN);
        }
    }
}

/// Pending stop request, if any. Checked at every per-file boundary.
pub fn interrupted() -> Option<WorkerError> {
    if GOT_SIGINT.load(Ordering::SeqCst) {
        Some(WorkerError::GotKilled)
    } else if GOT_SIGQUIT.load(Ordering::SeqCst) {
        Some(WorkerError::Incorrect("stopped by SIGQUIT".into()))
    } else {
        None
    }
}

fn unique_tag(job_no: usize) -> String {
    format!("{:x}_{}", std::process::id(), job_no)
}

/// Locate our host record, tolerating a rebuilt area: a changed id means
/// the queued position is void and the alias decides.
fn locate_host(fsa: &FsaArea, cli_fsa_id: u32, cli_pos: usize, alias: &str) -> Option<usize> {
    if fsa.area_id() == cli_fsa_id && cli_pos < fsa.host_count() {
        Some(cli_pos)
    } else {
        fsa.find_host(alias)
    }
}

fn bump_active(fsa: &FsaArea, pos: usize, delta: i32) {
    if let Ok(_con) = fsa.lock(pos, Region::Con) {
        let h = fsa.host_mut(pos);
        h.active_transfers = (h.active_transfers + delta).max(0);
    }
}

/// Send worker entry point; returns the process exit code.
pub fn run_send(cli: &WorkerCli) -> i32 {
    install_signal_handlers();
    util::init_tracing(&cli.work_dir, "fr-send", cli.debug);

    let fsa = match FsaArea::attach(&cli.work_dir) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("cannot attach host status area: {}", e);
            return WorkerStatus::Incorrect.code();
        }
    };
    let mut job = match JobDescriptor::load(&cli.work_dir, &cli.msg_or_dir) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("cannot read message {}: {}", cli.msg_or_dir, e);
            return WorkerStatus::Incorrect.code();
        }
    };
    if let Some(age) = cli.age_limit {
        job.age_limit_secs = age;
    }
    let Some(scheme) = job.scheme() else {
        tracing::error!("message {} names unknown scheme {}", cli.msg_or_dir, job.scheme);
        return WorkerStatus::Incorrect.code();
    };
    let Some(host_pos) = locate_host(&fsa, cli.fsa_id, cli.fsa_pos, &job.host_alias) else {
        // The database changed under us; nothing left to do.
        tracing::info!("host {} no longer present, quiet exit", job.host_alias);
        return WorkerStatus::TransferSuccess.code();
    };
    if cli.temp_toggle {
        let h = fsa.host_mut(host_pos);
        h.host_toggle = if h.host_toggle == 2 { 1 } else { 2 };
    }

    let rules = RenameRules::load(&cli.work_dir);
    let mut adapter = adapter_for(scheme);
    let mut machine = SendMachine {
        work_dir: &cli.work_dir,
        fsa: &fsa,
        host_pos,
        slot_no: cli.job_no,
        rules: &rules,
        unique_tag: unique_tag(cli.job_no),
        sequence: 0,
        home_dir: None,
    };
    let mut reporter = ProgressReporter::new(&fsa, host_pos, cli.job_no);
    let opts = SendOptions::default();

    bump_active(&fsa, host_pos, 1);
    reporter.set_connect_status(ConnectStatus::Connecting);

    let mut totals = SendOutcome::default();
    let mut controller = BurstController::new();
    let mut msg_name = cli.msg_or_dir.clone();
    let retries = cli.retries.unwrap_or(1).max(1);

    let result: Result<(), WorkerError> = (|| {
        let mut attempt = 0;
        loop {
            match machine.establish(adapter.as_mut(), &job, &opts) {
                Ok(()) => break,
                Err(e) if e.is_retriable_pre_transfer() && attempt + 1 < retries => {
                    attempt += 1;
                    tracing::warn!("connect attempt {} failed: {}", attempt, e);
                    std::thread::sleep(Duration::from_millis(util::compute_backoff_ms(
                        util::get_backoff_ms(),
                        attempt as u64,
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        loop {
            if let Some(e) = interrupted() {
                return Err(e);
            }
            reporter.set_connect_status(ConnectStatus::Active);
            let out =
                machine.run_job(adapter.as_mut(), &mut job, &msg_name, &opts, &mut reporter)?;
            totals.files_sent += out.files_sent;
            totals.bytes_sent += out.bytes_sent;
            totals.appends += out.appends;
            totals.discarded += out.discarded;

            let host = fsa.host(host_pos);
            if host.has_option(DISABLE_BURSTING)
                || controller.should_disconnect(
                    host.has_option(KEEP_CONNECTED_DISCONNECT),
                    host.keep_connected,
                    host.disconnect_after,
                )
            {
                break;
            }
            match check_burst(&cli.work_dir, cli.job_no, &job.host_alias, BURST_PROBE_TIMEOUT)
                .unwrap_or(BurstReply::No)
            {
                BurstReply::Yes { values_changed, msg_name: next } => {
                    let new_job = JobDescriptor::load(&cli.work_dir, &next)
                        .map_err(|e| WorkerError::Incorrect(e.to_string()))?;
                    apply_burst(adapter.as_mut(), &mut machine, &new_job, values_changed, &opts)?;
                    job = new_job;
                    msg_name = next;
                    controller.bursts += 1;
                }
                BurstReply::RescanSource | BurstReply::No => break,
                BurstReply::Neither => return Err(WorkerError::StillFilesToSend),
            }
        }
        reporter.set_connect_status(ConnectStatus::Closing);
        if let Err(e) = adapter.quit() {
            tracing::warn!("logout failed: {}", e);
        }
        Ok(())
    })();

    finish_worker(
        &cli.work_dir,
        &msg_name,
        &fsa,
        host_pos,
        &mut reporter,
        result,
        &format!(
            "send {} files {} bytes [BURST * {}] [APPEND * {}]",
            totals.files_sent, totals.bytes_sent, controller.bursts, totals.appends
        ),
    )
}

/// Fetch worker entry point; returns the process exit code.
pub fn run_fetch(cli: &WorkerCli) -> i32 {
    install_signal_handlers();
    util::init_tracing(&cli.work_dir, "fr-fetch", cli.debug);

    let fsa = match FsaArea::attach(&cli.work_dir) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("cannot attach host status area: {}", e);
            return WorkerStatus::Incorrect.code();
        }
    };
    let fra = match FraArea::attach(&cli.work_dir) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("cannot attach directory status area: {}", e);
            return WorkerStatus::Incorrect.code();
        }
    };
    let Some(dir_pos) = fra.find_dir(&cli.msg_or_dir) else {
        tracing::info!("directory {} no longer present, quiet exit", cli.msg_or_dir);
        return WorkerStatus::TransferSuccess.code();
    };
    let src = match DirSource::parse(fra.dir(dir_pos).url()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("{}", e);
            return WorkerStatus::Incorrect.code();
        }
    };
    if !src.scheme.can_retrieve() {
        tracing::error!("scheme {} cannot retrieve", src.scheme);
        return WorkerStatus::Incorrect.code();
    }
    let host_alias = fra.dir(dir_pos).alias().to_string();
    let Some(host_pos) = locate_host(&fsa, cli.fsa_id, cli.fsa_pos, &host_alias) else {
        tracing::info!("host for {} no longer present, quiet exit", cli.msg_or_dir);
        return WorkerStatus::TransferSuccess.code();
    };

    let mut adapter = adapter_for(src.scheme);
    let mut machine = FetchMachine {
        work_dir: &cli.work_dir,
        fsa: &fsa,
        fra: &fra,
        host_pos,
        dir_pos,
        slot_no: cli.job_no,
        home_dir: None,
    };
    let mut reporter = ProgressReporter::new(&fsa, host_pos, cli.job_no);
    let opts = FetchOptions {
        append_only: cli.append_only,
        remove_override: cli.remove,
        distributed: cli.distributed,
        ..Default::default()
    };

    let mut rl = match RetrieveList::attach(&cli.work_dir, &cli.msg_or_dir) {
        Ok(rl) => rl,
        Err(e) => {
            tracing::error!("cannot attach retrieve list: {}", e);
            return WorkerStatus::Incorrect.code();
        }
    };

    bump_active(&fsa, host_pos, 1);
    reporter.set_connect_status(ConnectStatus::Connecting);

    let mut totals = FetchOutcome::default();
    let controller = BurstController::new();

    let result: Result<(), WorkerError> = (|| {
        machine.establish(adapter.as_mut(), &src, &opts)?;
        loop {
            if let Some(e) = interrupted() {
                return Err(e);
            }
            reporter.set_connect_status(ConnectStatus::RetrieveActive);
            let out = machine.run_job(adapter.as_mut(), &mut rl, &opts, &mut reporter)?;
            totals.files_retrieved += out.files_retrieved;
            totals.bytes_retrieved += out.bytes_retrieved;

            let host = fsa.host(host_pos);
            if host.has_option(DISABLE_BURSTING)
                || controller.should_disconnect(
                    host.has_option(KEEP_CONNECTED_DISCONNECT),
                    host.keep_connected,
                    host.disconnect_after,
                )
            {
                break;
            }
            match check_burst(&cli.work_dir, cli.job_no, &host_alias, BURST_PROBE_TIMEOUT)
                .unwrap_or(BurstReply::No)
            {
                BurstReply::Yes { .. } | BurstReply::RescanSource => continue,
                BurstReply::No => break,
                BurstReply::Neither => return Err(WorkerError::StillFilesToSend),
            }
        }
        reporter.set_connect_status(ConnectStatus::Closing);
        if let Err(e) = adapter.quit() {
            tracing::warn!("logout failed: {}", e);
        }
        Ok(())
    })();

    // Claims are released on every path before the slot resets.
    machine.cleanup_claims(rl);

    finish_worker(
        &cli.work_dir,
        &cli.msg_or_dir,
        &fsa,
        host_pos,
        &mut reporter,
        result,
        &format!(
            "retrieved {} files {} bytes",
            totals.files_retrieved, totals.bytes_retrieved
        ),
    )
}

/// Common exit funnel: reconcile counters, record errors, emit the summary
/// line and map the outcome onto the process exit code.
fn finish_worker(
    work_dir: &std::path::Path,
    job_label: &str,
    fsa: &FsaArea,
    host_pos: usize,
    reporter: &mut ProgressReporter<'_>,
    result: Result<(), WorkerError>,
    summary: &str,
) -> i32 {
    let status = match &result {
        Ok(()) => WorkerStatus::TransferSuccess,
        Err(e) => {
            // An idled-out control connection is a requeue, not a host
            // failure.
            let status = if e.is_requeue_worthy() {
                WorkerStatus::StillFilesToSend
            } else {
                e.eval_timeout()
            };
            tracing::error!("{}", e);
            util::write_failures_jsonl(work_dir, job_label, std::slice::from_ref(e));
            if !status.is_requeue() && status != WorkerStatus::TransferSuccess {
                let _ = reporter.record_error(status.code() as u8);
            }
            status
        }
    };

    if MUST_ROLLBACK.load(Ordering::SeqCst) {
        tracing::error!("fatal signal during transfer, rolling back counters");
        let _ = reporter.fail_file();
    }

    let _ = reporter.reset_slot_on_exit(0, 0, false);
    bump_active(fsa, host_pos, -1);
    crate::fifo::send_log_record(
        work_dir,
        crate::fifo::SYSTEM_LOG_FIFO,
        &format!("{}|exit {}|{}", job_label, status.code(), summary),
    );
    tracing::info!("{}", summary);
    status.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stop_requested_by_default() {
        assert!(interrupted().is_none());
    }

    #[test]
    fn locate_host_prefers_position_then_alias() {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 5, 2).unwrap();
        fsa.host_mut(0).set_alias("a");
        fsa.host_mut(1).set_alias("b");
        // Matching generation: the queued position wins.
        assert_eq!(locate_host(&fsa, 5, 1, "a"), Some(1));
        // Stale generation: re-locate by alias.
        assert_eq!(locate_host(&fsa, 4, 1, "a"), Some(0));
        assert_eq!(locate_host(&fsa, 4, 1, "zz"), None);
    }

    #[test]
    fn bump_active_clamps_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        bump_active(&fsa, 0, 1);
        assert_eq!(fsa.host(0).active_transfers, 1);
        bump_active(&fsa, 0, -1);
        bump_active(&fsa, 0, -1);
        assert_eq!(fsa.host(0).active_transfers, 0);
    }
}
