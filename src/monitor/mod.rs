//! Monitor supervisor: one child process per configured peer, restart with
//! a storm limit, periodic fleet summaries, and a command FIFO.

pub mod summary;

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::fifo::{self, MON_CMD_FIFO, PROBE_ONLY_FIFO};
use crate::status::msa::{
    CURRENT_SUM, MonActive, MonStatus, MsaArea, PEER_DISABLED, PEER_DOWN, PEER_UP,
};
use self::summary::{PeriodStamp, group_totals, summarize_period};

/// Seconds between full rescans of the peer set.
pub const AFD_MON_RESCAN_TIME: u64 = 60;
/// Delay before a failed log fetcher is tried again.
pub const RETRY_INTERVAL: i64 = 60;
/// A child living shorter than this counts toward the restart storm.
pub const QUICK_RESTART_WINDOW: Duration = Duration::from_secs(5);
/// Quick restarts tolerated before the supervisor gives up on a peer.
pub const MAX_QUICK_RESTARTS: u32 = 20;
/// Config file re-stat cadence.
const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// Exit statuses of log-fetch children.
pub const LOG_REMOTE_HANGUP: i32 = 40;
pub const LOG_TIMEOUT: i32 = 41;
pub const LOG_FAILED_CMD: i32 = 42;
pub const LOG_CONNECT_ERROR: i32 = 43;
pub const LOG_MISSED_PACKET: i32 = 44;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    pub alias: String,
    pub hostname: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u32,
    #[serde(default)]
    pub group: String,
}

fn default_peer_port() -> u16 {
    8040
}

fn default_poll_interval() -> u32 {
    5
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MonitorConfig {
    pub peers: Vec<PeerConfig>,
}

impl MonitorConfig {
    pub fn path(work_dir: &Path) -> PathBuf {
        work_dir.join("etc").join("mon.json")
    }

    pub fn load(work_dir: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(Self::path(work_dir))?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Commands arriving on the monitor FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonCommand {
    Shutdown,
    IsAlive,
    GotLogCapabilities(usize),
    DisableMon(usize),
    EnableMon(usize),
}

impl MonCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "S" => Some(MonCommand::Shutdown),
            "A" => Some(MonCommand::IsAlive),
            "L" => parts.next()?.parse().ok().map(MonCommand::GotLogCapabilities),
            "D" => parts.next()?.parse().ok().map(MonCommand::DisableMon),
            "E" => parts.next()?.parse().ok().map(MonCommand::EnableMon),
            _ => None,
        }
    }
}

/// Restart-storm bookkeeping for one child.
#[derive(Debug, Default)]
pub struct RestartTracker {
    quick_restarts: u32,
    pub gave_up: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    GiveUp,
}

impl RestartTracker {
    /// Decide after a child exit. Long-lived children reset the storm
    /// counter; the twenty-first quick death is the last.
    pub fn note_exit(&mut self, lived: Duration) -> RestartDecision {
        if self.gave_up {
            return RestartDecision::GiveUp;
        }
        if lived < QUICK_RESTART_WINDOW {
            self.quick_restarts += 1;
            if self.quick_restarts > MAX_QUICK_RESTARTS {
                self.gave_up = true;
                return RestartDecision::GiveUp;
            }
        } else {
            self.quick_restarts = 1;
        }
        RestartDecision::Restart
    }
}

/// What to do with a finished log-fetch child.
#[derive(Debug, PartialEq, Eq)]
pub enum LogChildAction {
    RestartNow,
    RetryAt(i64),
}

pub fn classify_log_child_exit(code: Option<i32>, now: i64) -> LogChildAction {
    match code {
        Some(LOG_MISSED_PACKET) => LogChildAction::RestartNow,
        Some(LOG_REMOTE_HANGUP) | Some(LOG_TIMEOUT) | Some(LOG_FAILED_CMD)
        | Some(LOG_CONNECT_ERROR) => LogChildAction::RetryAt(now + RETRY_INTERVAL),
        _ => LogChildAction::RetryAt(now + RETRY_INTERVAL),
    }
}

struct ChildSlot {
    peer_pos: usize,
    mon: Option<Child>,
    log: Option<Child>,
    mon_started: Instant,
    tracker: RestartTracker,
    retry_time: i64,
    disabled: bool,
}

pub struct Supervisor {
    work_dir: PathBuf,
    config: MonitorConfig,
    config_mtime: Option<std::time::SystemTime>,
    msa: MsaArea,
    children: Vec<ChildSlot>,
    period: PeriodStamp,
    area_generation: u32,
}

impl Supervisor {
    pub fn new(work_dir: &Path) -> anyhow::Result<Self> {
        let config = MonitorConfig::load(work_dir)?;
        let config_mtime = std::fs::metadata(MonitorConfig::path(work_dir))
            .and_then(|m| m.modified())
            .ok();
        let msa = Self::build_msa(work_dir, &config, 1)?;
        let children = (0..config.peers.len())
            .map(|peer_pos| ChildSlot {
                peer_pos,
                mon: None,
                log: None,
                mon_started: Instant::now(),
                tracker: RestartTracker::default(),
                retry_time: 0,
                disabled: false,
            })
            .collect();
        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            config,
            config_mtime,
            msa,
            children,
            period: PeriodStamp::from_local(chrono::Local::now()),
            area_generation: 1,
        })
    }

    fn build_msa(
        work_dir: &Path,
        config: &MonitorConfig,
        generation: u32,
    ) -> anyhow::Result<MsaArea> {
        let msa = MsaArea::create(work_dir, generation, config.peers.len())?;
        for (i, peer) in config.peers.iter().enumerate() {
            let rec = msa.peer_mut(i);
            rec.set_alias(&peer.alias);
            rec.set_hostname(&peer.hostname);
            rec.set_group(&peer.group);
            rec.port = peer.port;
            rec.poll_interval = peer.poll_interval;
            rec.connect_status = PEER_DOWN;
        }
        Ok(msa)
    }

    fn spawn_child(&self, peer_pos: usize, log_fetch: bool) -> std::io::Result<Child> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg(if log_fetch { "--log-fetch" } else { "--peer-poll" })
            .arg(peer_pos.to_string())
            .arg("-w")
            .arg(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn()
    }

    fn write_status_files(&self) {
        let children = self
            .children
            .iter()
            .map(|c| {
                (
                    c.mon.as_ref().map(|p| p.id() as i32).unwrap_or(0),
                    c.log.as_ref().map(|p| p.id() as i32).unwrap_or(0),
                )
            })
            .collect();
        let blob = MonActive {
            own_pid: std::process::id() as i32,
            // The log shippers are external programs; their slots stay 0
            // until one registers.
            sys_log_pid: 0,
            mon_log_pid: 0,
            children,
        };
        if let Err(e) = blob.write(&self.work_dir) {
            tracing::warn!("cannot write MON_ACTIVE: {}", e);
        }
        let st = MonStatus {
            afd_mon: 1,
            mon_sys_log: 0,
            mon_log: 0,
            pad: 0,
            start_time: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = st.write(&self.work_dir) {
            tracing::warn!("cannot write monitor status: {}", e);
        }
    }

    fn start_all(&mut self) {
        for i in 0..self.children.len() {
            if self.children[i].disabled || self.children[i].mon.is_some() {
                continue;
            }
            match self.spawn_child(self.children[i].peer_pos, false) {
                Ok(child) => {
                    self.children[i].mon = Some(child);
                    self.children[i].mon_started = Instant::now();
                }
                Err(e) => {
                    tracing::error!(
                        "cannot start monitor child for {}: {}",
                        self.config.peers[self.children[i].peer_pos].alias,
                        e
                    );
                }
            }
        }
        self.write_status_files();
    }

    fn stop_all(&mut self) {
        for slot in &mut self.children {
            for child in [slot.mon.take(), slot.log.take()].into_iter().flatten() {
                let pid = child.id() as i32;
                unsafe {
                    libc::kill(pid, libc::SIGINT);
                }
                let mut child = child;
                let _ = child.wait();
            }
        }
    }

    fn handle_command(&mut self, cmd: MonCommand) -> bool {
        match cmd {
            MonCommand::Shutdown => {
                tracing::info!("shutdown requested");
                self.stop_all();
                return false;
            }
            MonCommand::IsAlive => {
                let probe = self.work_dir.join(PROBE_ONLY_FIFO);
                if let Some(mut w) = fifo::open_writer(&probe) {
                    use std::io::Write;
                    let _ = w.write(&[b'1']);
                }
            }
            MonCommand::GotLogCapabilities(pos) => {
                if let Some(idx) = self.children.iter().position(|c| c.peer_pos == pos) {
                    if let Some(mut old) = self.children[idx].log.take() {
                        unsafe {
                            libc::kill(old.id() as i32, libc::SIGINT);
                        }
                        let _ = old.wait();
                    }
                    self.msa.peer_mut(pos).got_log_capabilities = 1;
                    match self.spawn_child(pos, true) {
                        Ok(child) => {
                            self.children[idx].log = Some(child);
                        }
                        Err(e) => tracing::error!("cannot start log fetcher for {}: {}", pos, e),
                    }
                }
            }
            MonCommand::DisableMon(pos) => {
                if let Some(slot) = self.children.iter_mut().find(|c| c.peer_pos == pos) {
                    slot.disabled = true;
                    for child in [slot.mon.take(), slot.log.take()].into_iter().flatten() {
                        unsafe {
                            libc::kill(child.id() as i32, libc::SIGINT);
                        }
                        let mut child = child;
                        let _ = child.wait();
                    }
                    self.msa.peer_mut(pos).connect_status = PEER_DISABLED;
                    tracing::info!("peer {} disabled", pos);
                }
            }
            MonCommand::EnableMon(pos) => {
                if let Some(slot) = self.children.iter_mut().find(|c| c.peer_pos == pos) {
                    slot.disabled = false;
                    slot.tracker = RestartTracker::default();
                    self.msa.peer_mut(pos).connect_status = PEER_DOWN;
                    tracing::info!("peer {} enabled", pos);
                }
            }
        }
        true
    }

    fn reap_children(&mut self) {
        let now = chrono::Utc::now().timestamp();
        for i in 0..self.children.len() {
            // Peer monitor.
            let exited = match self.children[i].mon.as_mut().and_then(|c| c.try_wait().ok()) {
                Some(Some(status)) => Some(status),
                _ => None,
            };
            if let Some(status) = exited {
                self.children[i].mon = None;
                let lived = self.children[i].mon_started.elapsed();
                let alias = self.config.peers[self.children[i].peer_pos].alias.clone();
                if let Some(sig) = status.signal() {
                    tracing::warn!("monitor child for {} died on signal {}", alias, sig);
                } else {
                    tracing::warn!(
                        "monitor child for {} exited with {}",
                        alias,
                        status.code().unwrap_or(-1)
                    );
                }
                if !self.children[i].disabled {
                    match self.children[i].tracker.note_exit(lived) {
                        RestartDecision::Restart => {
                            if let Ok(child) = self.spawn_child(self.children[i].peer_pos, false) {
                                self.children[i].mon = Some(child);
                                self.children[i].mon_started = Instant::now();
                            }
                        }
                        RestartDecision::GiveUp => {
                            tracing::error!(
                                "giving up on peer {} after {} rapid restarts",
                                alias,
                                MAX_QUICK_RESTARTS
                            );
                            self.msa.peer_mut(self.children[i].peer_pos).connect_status =
                                PEER_DOWN;
                        }
                    }
                }
            }

            // Log fetcher.
            let exited = match self.children[i].log.as_mut().and_then(|c| c.try_wait().ok()) {
                Some(Some(status)) => Some(status),
                _ => None,
            };
            if let Some(status) = exited {
                self.children[i].log = None;
                match classify_log_child_exit(status.code(), now) {
                    LogChildAction::RestartNow => {
                        if let Ok(child) = self.spawn_child(self.children[i].peer_pos, true) {
                            self.children[i].log = Some(child);
                        }
                    }
                    LogChildAction::RetryAt(t) => {
                        self.children[i].retry_time = t;
                        tracing::info!(
                            "log fetcher for peer {} failed ({}), retry at {}",
                            self.children[i].peer_pos,
                            status.code().unwrap_or(-1),
                            t
                        );
                    }
                }
            } else if self.children[i].log.is_none()
                && self.children[i].retry_time > 0
                && now >= self.children[i].retry_time
                && self.msa.peer(self.children[i].peer_pos).got_log_capabilities != 0
                && !self.children[i].disabled
            {
                self.children[i].retry_time = 0;
                if let Ok(child) = self.spawn_child(self.children[i].peer_pos, true) {
                    self.children[i].log = Some(child);
                }
            }
        }
    }

    fn check_config(&mut self) -> anyhow::Result<()> {
        let mtime = std::fs::metadata(MonitorConfig::path(&self.work_dir))
            .and_then(|m| m.modified())
            .ok();
        if mtime != self.config_mtime {
            tracing::info!("peer configuration changed, rebuilding");
            self.stop_all();
            self.config = MonitorConfig::load(&self.work_dir)?;
            self.config_mtime = mtime;
            self.area_generation += 1;
            self.msa = Self::build_msa(&self.work_dir, &self.config, self.area_generation)?;
            self.children = (0..self.config.peers.len())
                .map(|peer_pos| ChildSlot {
                    peer_pos,
                    mon: None,
                    log: None,
                    mon_started: Instant::now(),
                    tracker: RestartTracker::default(),
                    retry_time: 0,
                    disabled: false,
                })
                .collect();
            self.start_all();
        }
        Ok(())
    }

    fn has_groups(&self) -> bool {
        self.config.peers.iter().any(|p| !p.group.is_empty())
    }

    /// Main loop: wait on the command channel with a rescan-aligned
    /// timeout, reap and restart children, re-stat the config, and emit
    /// summaries on period boundaries. A reader thread turns the command
    /// FIFO into parsed commands.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let cmd_path = self.work_dir.join(MON_CMD_FIFO);
        let mut cmd_fifo = fifo::Fifo::open(&cmd_path)?;
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<MonCommand>();
        std::thread::spawn(move || {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                match cmd_fifo.drain() {
                    Ok(bytes) => {
                        pending.extend_from_slice(&bytes);
                        while let Some(nl) = pending.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=nl).collect();
                            if let Some(cmd) = MonCommand::parse(&String::from_utf8_lossy(
                                &line[..line.len() - 1],
                            )) && cmd_tx.send(cmd).is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(_) => return,
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        self.start_all();

        let mut last_config_check = Instant::now();
        let mut last_group_tick = Instant::now();
        loop {
            let now_secs = chrono::Utc::now().timestamp() as u64;
            let wait = AFD_MON_RESCAN_TIME - (now_secs % AFD_MON_RESCAN_TIME);
            let deadline = Instant::now() + Duration::from_secs(wait.clamp(1, AFD_MON_RESCAN_TIME));

            while Instant::now() < deadline {
                match cmd_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(cmd) => {
                        if !self.handle_command(cmd) {
                            return Ok(());
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {}
                }
                self.reap_children();
                if last_config_check.elapsed() >= CONFIG_CHECK_INTERVAL {
                    last_config_check = Instant::now();
                    self.check_config()?;
                }
                if self.has_groups() && last_group_tick.elapsed() >= Duration::from_secs(1) {
                    last_group_tick = Instant::now();
                    for (group, totals) in group_totals(&self.msa) {
                        tracing::debug!(
                            "group {}: {} files received, {} files send",
                            group,
                            totals[0],
                            totals[2]
                        );
                    }
                }
            }

            let now = PeriodStamp::from_local(chrono::Local::now());
            for slot in self.period.due_slots(&now) {
                let report = summarize_period(&self.msa, slot);
                fifo::send_log_record(
                    &self.work_dir,
                    crate::fifo::MONITOR_LOG_FIFO,
                    &format!(
                        "summary|{}|files_send {} bytes_send {}",
                        slot, report.fleet[2], report.fleet[3]
                    ),
                );
            }
            self.period = now;
        }
    }
}

/// What a peer publishes on its status endpoint.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct PeerStatusReport {
    pub files_received: u64,
    pub bytes_received: u64,
    pub files_send: u64,
    pub bytes_send: u64,
    pub connections: u64,
    pub total_errors: u64,
    #[serde(default)]
    pub log_bytes: u64,
}

/// Hidden child mode: poll one peer's status endpoint and mirror it into
/// the peer record until told to stop.
pub fn run_peer_poll(work_dir: &Path, pos: usize) -> anyhow::Result<()> {
    crate::worker::install_signal_handlers();
    let msa = MsaArea::attach(work_dir)?;
    if pos >= msa.peer_count() {
        anyhow::bail!("peer position {} out of range", pos);
    }
    let (hostname, port, interval) = {
        let p = msa.peer(pos);
        (p.hostname().to_string(), p.port, p.poll_interval.max(1) as u64)
    };
    let url = format!("http://{}:{}/status.json", hostname, port);
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(10))
        .build();
    loop {
        if crate::worker::interrupted().is_some() {
            return Ok(());
        }
        match agent.get(&url).call() {
            Ok(resp) => match resp.into_json::<PeerStatusReport>() {
                Ok(report) => {
                    let peer = msa.peer_mut(pos);
                    let c = &mut peer.counters[CURRENT_SUM];
                    c.files_received = report.files_received;
                    c.bytes_received = report.bytes_received;
                    c.files_send = report.files_send;
                    c.bytes_send = report.bytes_send;
                    c.connections = report.connections;
                    c.total_errors = report.total_errors;
                    peer.connect_status = PEER_UP;
                    peer.last_data_time = chrono::Utc::now().timestamp();
                }
                Err(e) => {
                    tracing::warn!("bad status payload from {}: {}", hostname, e);
                    msa.peer_mut(pos).connect_status = PEER_DOWN;
                }
            },
            Err(e) => {
                tracing::debug!("poll of {} failed: {}", hostname, e);
                msa.peer_mut(pos).connect_status = PEER_DOWN;
            }
        }
        std::thread::sleep(Duration::from_secs(interval));
    }
}

/// Hidden child mode: track the peer's advertised log volume.
pub fn run_log_fetch(work_dir: &Path, pos: usize) -> anyhow::Result<i32> {
    crate::worker::install_signal_handlers();
    let msa = MsaArea::attach(work_dir)?;
    if pos >= msa.peer_count() {
        anyhow::bail!("peer position {} out of range", pos);
    }
    let (hostname, port) = {
        let p = msa.peer(pos);
        (p.hostname().to_string(), p.port)
    };
    let url = format!("http://{}:{}/logs/size", hostname, port);
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(30))
        .build();
    loop {
        if crate::worker::interrupted().is_some() {
            return Ok(0);
        }
        match agent.get(&url).call() {
            Ok(resp) => {
                let size: u64 = resp
                    .into_string()
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0);
                msa.peer_mut(pos).counters[CURRENT_SUM].log_bytes_received = size;
            }
            Err(ureq::Error::Transport(_)) => return Ok(LOG_CONNECT_ERROR),
            Err(_) => return Ok(LOG_FAILED_CMD),
        }
        std::thread::sleep(Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(MonCommand::parse("S"), Some(MonCommand::Shutdown));
        assert_eq!(MonCommand::parse("A"), Some(MonCommand::IsAlive));
        assert_eq!(MonCommand::parse("L 3"), Some(MonCommand::GotLogCapabilities(3)));
        assert_eq!(MonCommand::parse("D 0"), Some(MonCommand::DisableMon(0)));
        assert_eq!(MonCommand::parse("E 7"), Some(MonCommand::EnableMon(7)));
        assert_eq!(MonCommand::parse("Z"), None);
        assert_eq!(MonCommand::parse("L"), None);
    }

    #[test]
    fn restart_storm_gives_up_after_twenty() {
        let mut t = RestartTracker::default();
        for _ in 0..MAX_QUICK_RESTARTS {
            assert_eq!(t.note_exit(Duration::from_secs(1)), RestartDecision::Restart);
        }
        assert_eq!(t.note_exit(Duration::from_secs(1)), RestartDecision::GiveUp);
        assert!(t.gave_up);
        // Once given up, it stays given up.
        assert_eq!(t.note_exit(Duration::from_secs(100)), RestartDecision::GiveUp);
    }

    #[test]
    fn long_lived_child_resets_the_storm() {
        let mut t = RestartTracker::default();
        for _ in 0..10 {
            assert_eq!(t.note_exit(Duration::from_secs(1)), RestartDecision::Restart);
        }
        assert_eq!(t.note_exit(Duration::from_secs(60)), RestartDecision::Restart);
        for _ in 0..MAX_QUICK_RESTARTS - 1 {
            assert_eq!(t.note_exit(Duration::from_secs(1)), RestartDecision::Restart);
        }
        assert!(!t.gave_up);
    }

    #[test]
    fn log_child_classification() {
        assert_eq!(classify_log_child_exit(Some(LOG_MISSED_PACKET), 100), LogChildAction::RestartNow);
        assert_eq!(
            classify_log_child_exit(Some(LOG_TIMEOUT), 100),
            LogChildAction::RetryAt(100 + RETRY_INTERVAL)
        );
        assert_eq!(
            classify_log_child_exit(Some(LOG_CONNECT_ERROR), 0),
            LogChildAction::RetryAt(RETRY_INTERVAL)
        );
        assert_eq!(
            classify_log_child_exit(None, 5),
            LogChildAction::RetryAt(5 + RETRY_INTERVAL)
        );
    }

    #[test]
    fn config_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("mon.json"),
            r#"{"peers": [{"alias": "site-a", "hostname": "a.example"}]}"#,
        )
        .unwrap();
        let cfg = MonitorConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].port, 8040);
        assert_eq!(cfg.peers[0].poll_interval, 5);
        assert!(cfg.peers[0].group.is_empty());
    }

    #[test]
    fn supervisor_builds_msa_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("mon.json"),
            r#"{"peers": [
                {"alias": "a", "hostname": "a.example", "port": 9000, "group": "eu"},
                {"alias": "b", "hostname": "b.example"}
            ]}"#,
        )
        .unwrap();
        let sup = Supervisor::new(dir.path()).unwrap();
        assert_eq!(sup.msa.peer_count(), 2);
        assert_eq!(sup.msa.peer(0).alias(), "a");
        assert_eq!(sup.msa.peer(0).port, 9000);
        assert_eq!(sup.msa.peer(0).group(), "eu");
        assert_eq!(sup.msa.peer(1).port, 8040);
        assert!(sup.has_groups());
    }
}
