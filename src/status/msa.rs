//! Peer status area for the monitor, plus the monitor's own status files.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StatusAreaError;
use crate::status::{AREA_HEADER_LEN, MappedArea, read_cstr, write_cstr};

pub const MAX_PEER_ALIAS_LEN: usize = 40;
pub const MAX_PEER_HOSTNAME_LEN: usize = 64;
pub const MAX_GROUP_LEN: usize = 40;

const MSA_MAGIC: u32 = 0x4652_4D41; // "FRMA"

/// Summary slot indices.
pub const CURRENT_SUM: usize = 0;
pub const HOUR_SUM: usize = 1;
pub const DAY_SUM: usize = 2;
pub const WEEK_SUM: usize = 3;
pub const MONTH_SUM: usize = 4;
pub const YEAR_SUM: usize = 5;
pub const SUM_SLOTS: usize = 6;

/// Monotonically growing counters a peer reports.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    pub files_received: u64,
    pub bytes_received: u64,
    pub files_send: u64,
    pub bytes_send: u64,
    pub connections: u64,
    pub total_errors: u64,
    pub log_bytes_received: u64,
}

impl PeerCounters {
    pub const FIELDS: usize = 7;

    pub fn as_array(&self) -> [u64; Self::FIELDS] {
        [
            self.files_received,
            self.bytes_received,
            self.files_send,
            self.bytes_send,
            self.connections,
            self.total_errors,
            self.log_bytes_received,
        ]
    }
}

/// Peer liveness as last observed by its monitor child.
pub const PEER_DOWN: u8 = 0;
pub const PEER_UP: u8 = 1;
pub const PEER_DISABLED: u8 = 2;

/// One monitored peer record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PeerStatus {
    pub alias: [u8; MAX_PEER_ALIAS_LEN],
    pub hostname: [u8; MAX_PEER_HOSTNAME_LEN],
    pub group: [u8; MAX_GROUP_LEN],
    pub port: u16,
    pub connect_status: u8,
    pub got_log_capabilities: u8,
    pub log_capabilities: u32,
    pub poll_interval: u32,
    pub restart_count: u32,
    pub last_data_time: i64,
    pub retry_time: i64,
    pub counters: [PeerCounters; SUM_SLOTS],
}

impl PeerStatus {
    pub fn alias(&self) -> &str {
        read_cstr(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        write_cstr(&mut self.alias, alias);
    }

    pub fn hostname(&self) -> &str {
        read_cstr(&self.hostname)
    }

    pub fn set_hostname(&mut self, h: &str) {
        write_cstr(&mut self.hostname, h);
    }

    pub fn group(&self) -> &str {
        read_cstr(&self.group)
    }

    pub fn set_group(&mut self, g: &str) {
        write_cstr(&mut self.group, g);
    }
}

pub const MSA_FILE: &str = "fifo/msa";
pub const MSA_ID_FILE: &str = "fifo/msa.id";

/// Attached peer status area.
pub struct MsaArea {
    area: MappedArea,
    id_path: PathBuf,
}

impl MsaArea {
    pub fn attach(work_dir: &Path) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(MSA_FILE);
        let area =
            MappedArea::attach(&path, MSA_MAGIC, std::mem::size_of::<PeerStatus>(), "msa")?;
        Ok(Self { area, id_path: work_dir.join(MSA_ID_FILE) })
    }

    pub fn create(work_dir: &Path, area_id: u32, peers: usize) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(MSA_FILE);
        let area = MappedArea::create(
            &path,
            MSA_MAGIC,
            area_id,
            peers,
            std::mem::size_of::<PeerStatus>(),
        )?;
        let id_path = work_dir.join(MSA_ID_FILE);
        MappedArea::write_id_file(&id_path, area_id)?;
        Ok(Self { area, id_path })
    }

    pub fn peer_count(&self) -> usize {
        self.area.header().record_count as usize
    }

    fn record_offset(&self, pos: usize) -> usize {
        AREA_HEADER_LEN + pos * std::mem::size_of::<PeerStatus>()
    }

    pub fn peer(&self, pos: usize) -> &PeerStatus {
        assert!(pos < self.peer_count());
        let off = self.record_offset(pos);
        unsafe { &*(self.area.map.as_ptr().add(off) as *const PeerStatus) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn peer_mut(&self, pos: usize) -> &mut PeerStatus {
        assert!(pos < self.peer_count());
        let off = self.record_offset(pos);
        unsafe { &mut *(self.area.map.as_ptr().add(off) as *mut PeerStatus) }
    }

    pub fn check_stale(&self) -> Result<(), StatusAreaError> {
        self.area.check_stale(&self.id_path, "msa")
    }
}

pub const MON_ACTIVE_FILE: &str = "fifo/MON_ACTIVE";
pub const MON_STATUS_FILE: &str = "fifo/AFD_MON_STATUS";

/// Packed pid blob the monitor writes on startup so a crashed monitor's
/// children can be found and reaped on the next start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonActive {
    pub own_pid: i32,
    pub sys_log_pid: i32,
    pub mon_log_pid: i32,
    pub children: Vec<(i32, i32)>,
}

impl MonActive {
    pub fn write(&self, work_dir: &Path) -> std::io::Result<()> {
        let path = work_dir.join(MON_ACTIVE_FILE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(16 + self.children.len() * 8);
        buf.extend_from_slice(&self.own_pid.to_le_bytes());
        buf.extend_from_slice(&self.sys_log_pid.to_le_bytes());
        buf.extend_from_slice(&self.mon_log_pid.to_le_bytes());
        buf.extend_from_slice(&(self.children.len() as i32).to_le_bytes());
        for (mon_pid, log_pid) in &self.children {
            buf.extend_from_slice(&mon_pid.to_le_bytes());
            buf.extend_from_slice(&log_pid.to_le_bytes());
        }
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&buf)
    }

    pub fn read(work_dir: &Path) -> std::io::Result<Self> {
        let path = work_dir.join(MON_ACTIVE_FILE);
        let mut buf = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut buf)?;
        let word = |i: usize| -> std::io::Result<i32> {
            let s = buf.get(i * 4..i * 4 + 4).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short MON_ACTIVE")
            })?;
            Ok(i32::from_le_bytes(s.try_into().unwrap()))
        };
        let own_pid = word(0)?;
        let sys_log_pid = word(1)?;
        let mon_log_pid = word(2)?;
        let n = word(3)?.max(0) as usize;
        let mut children = Vec::with_capacity(n);
        for i in 0..n {
            children.push((word(4 + i * 2)?, word(5 + i * 2)?));
        }
        Ok(Self { own_pid, sys_log_pid, mon_log_pid, children })
    }
}

/// Fixed-size monitor self-status record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MonStatus {
    pub afd_mon: u8,
    pub mon_sys_log: u8,
    pub mon_log: u8,
    pub pad: u8,
    pub start_time: i64,
}

impl MonStatus {
    pub fn write(&self, work_dir: &Path) -> std::io::Result<()> {
        let path = work_dir.join(MON_STATUS_FILE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&[self.afd_mon, self.mon_sys_log, self.mon_log, self.pad]);
        buf.extend_from_slice(&self.start_time.to_le_bytes());
        std::fs::write(path, buf)
    }

    pub fn read(work_dir: &Path) -> std::io::Result<Self> {
        let buf = std::fs::read(work_dir.join(MON_STATUS_FILE))?;
        if buf.len() < 12 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short AFD_MON_STATUS",
            ));
        }
        Ok(Self {
            afd_mon: buf[0],
            mon_sys_log: buf[1],
            mon_log: buf[2],
            pad: buf[3],
            start_time: i64::from_le_bytes(buf[4..12].try_into().unwrap()),
        })
    }
}
