//! Uniform operation surface over the four transfer schemes.
//!
//! Each adapter owns its transport and at most one open remote file; the
//! state machines drive `open → read/write → close` strictly sequentially,
//! so the trait models the open file implicitly instead of handing out
//! borrowed handles. Per-protocol quirks stay inside the adapters; callers
//! only see `ProtoError`.

pub mod ftp;
pub mod http;
pub mod scp;
pub mod sftp;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProtoError;

pub type ProtoResult<T> = Result<T, ProtoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ftp,
    Ftps,
    Sftp,
    Scp,
    Http,
    Https,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ftp" => Some(Scheme::Ftp),
            "ftps" => Some(Scheme::Ftps),
            "sftp" => Some(Scheme::Sftp),
            "scp" => Some(Scheme::Scp),
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ftp | Scheme::Ftps => 21,
            Scheme::Sftp | Scheme::Scp => 22,
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// Whether the scheme can fetch files at all (SCP is send-only here).
    pub fn can_retrieve(self) -> bool {
        !matches!(self, Scheme::Scp)
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scheme::Ftp => "ftp",
            Scheme::Ftps => "ftps",
            Scheme::Sftp => "sftp",
            Scheme::Scp => "scp",
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        f.write_str(s)
    }
}

/// Connection tuning shared by all adapters.
#[derive(Debug, Clone)]
pub struct ConnectTuning {
    pub port: u16,
    pub timeout: Duration,
    pub tcp_keepalive: bool,
    pub tls_strict_verify: bool,
    /// FTP only: passive data connections.
    pub passive: bool,
}

impl Default for ConnectTuning {
    fn default() -> Self {
        Self {
            port: 0,
            timeout: Duration::from_secs(30),
            tcp_keepalive: false,
            tls_strict_verify: true,
            passive: true,
        }
    }
}

/// Authentication material. A proxy login is a scripted command sequence
/// played against the control connection before the real login.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password,
    PublicKey(PathBuf),
    Proxy(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Binary,
    Ascii,
    Dos,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteStat {
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

pub trait ProtocolAdapter: Send {
    fn scheme(&self) -> Scheme;

    fn connect(&mut self, host: &str, tuning: &ConnectTuning) -> ProtoResult<()>;
    fn authenticate(&mut self, user: &str, secret: &str, method: &AuthMethod) -> ProtoResult<()>;
    fn set_transfer_mode(&mut self, mode: TransferMode) -> ProtoResult<()>;

    fn pwd(&mut self) -> ProtoResult<String>;
    /// Change directory; with `create` missing components are created with
    /// `mode` and the created path is returned.
    fn cd(&mut self, path: &str, create: bool, mode: u32) -> ProtoResult<Option<String>>;
    fn stat(&mut self, path: &str) -> ProtoResult<RemoteStat>;
    /// Raw directory listing lines, format is protocol-specific.
    fn list(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>>;
    /// Bare file names only (NLST-style).
    fn list_names(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>>;

    fn open_read(&mut self, path: &str, offset: u64) -> ProtoResult<()>;
    /// Open for writing at `offset` (0 = truncate/create, else append).
    fn open_write(&mut self, path: &str, offset: u64) -> ProtoResult<()>;
    /// Like `open_write` but with the total size known up front. SCP needs
    /// it; everyone else ignores the hint.
    fn open_write_sized(&mut self, path: &str, offset: u64, _size: Option<u64>) -> ProtoResult<()> {
        self.open_write(path, offset)
    }
    fn read(&mut self, buf: &mut [u8]) -> ProtoResult<usize>;
    fn write(&mut self, buf: &[u8]) -> ProtoResult<()>;
    fn close(&mut self) -> ProtoResult<()>;

    fn move_file(
        &mut self,
        src: &str,
        dst: &str,
        create_parents: bool,
        mode: u32,
    ) -> ProtoResult<Option<String>>;
    fn delete(&mut self, path: &str) -> ProtoResult<()>;
    fn set_mtime(&mut self, path: &str, mtime: i64) -> ProtoResult<()>;
    fn chmod(&mut self, path: &str, mode: u32) -> ProtoResult<()>;
    /// Protocol escape hatch (FTP SITE); other schemes refuse.
    fn exec_site(&mut self, cmd: &str) -> ProtoResult<()>;

    fn quit(&mut self) -> ProtoResult<()>;

    /// Whether a cheap remote-size probe exists (SIZE, SFTP stat, HEAD).
    fn supports_append_probe(&self) -> bool {
        true
    }

    /// Whether reads benefit from the bounded read-ahead window.
    fn supports_multi_read(&self) -> bool {
        false
    }
}

/// Concrete adapter for a scheme, boxed for the state machines.
pub fn adapter_for(scheme: Scheme) -> Box<dyn ProtocolAdapter> {
    match scheme {
        Scheme::Ftp | Scheme::Ftps => Box::new(ftp::FtpAdapter::new(scheme)),
        Scheme::Sftp => Box::new(sftp::SftpAdapter::new()),
        Scheme::Scp => Box::new(scp::ScpAdapter::new()),
        Scheme::Http | Scheme::Https => Box::new(http::HttpAdapter::new(scheme)),
    }
}

/// Parse the size column out of one LIST line: skip `file_size_offset`
/// whitespace-separated columns, then take digits until the first non-digit.
/// A negative offset means the listing carries no size.
pub fn parse_list_size(line: &str, file_size_offset: i8) -> Option<u64> {
    if file_size_offset < 0 {
        return None;
    }
    let mut cols = line.split_whitespace();
    for _ in 0..file_size_offset {
        cols.next()?;
    }
    let col = cols.next()?;
    let digits: String = col.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { digits.parse().ok() }
}

/// Bounded read-ahead window over an adapter's open file.
///
/// Models the pipelined multi-read used on fetches: a fixed number of block
/// reads are kept in flight (here: buffered ahead), callers catch them in
/// order, and `discard` falls back to plain single reads when the far end
/// rejects the window.
pub struct MultiRead {
    window: std::collections::VecDeque<Vec<u8>>,
    depth: usize,
    block: usize,
    eof: bool,
    single_reads: bool,
}

impl MultiRead {
    pub fn init(depth: usize, block: usize) -> Self {
        Self {
            window: std::collections::VecDeque::with_capacity(depth),
            depth: depth.max(1),
            block: block.max(1),
            eof: false,
            single_reads: false,
        }
    }

    /// Top up the window to its depth.
    fn dispatch(&mut self, adapter: &mut dyn ProtocolAdapter) -> ProtoResult<()> {
        while !self.eof && !self.single_reads && self.window.len() < self.depth {
            let mut buf = vec![0u8; self.block];
            let n = adapter.read(&mut buf)?;
            if n == 0 {
                self.eof = true;
                break;
            }
            buf.truncate(n);
            self.window.push_back(buf);
        }
        Ok(())
    }

    /// Next block in order; `None` at end of file. Short blocks near EOF are
    /// normal and complete the file.
    pub fn catch(&mut self, adapter: &mut dyn ProtocolAdapter) -> ProtoResult<Option<Vec<u8>>> {
        if self.single_reads {
            let mut buf = vec![0u8; self.block];
            let n = adapter.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            return Ok(Some(buf));
        }
        self.dispatch(adapter)?;
        Ok(self.window.pop_front())
    }

    /// Drop all outstanding blocks and continue with single reads.
    pub fn discard(&mut self) {
        self.window.clear();
        self.single_reads = true;
    }

    pub fn is_single_reads(&self) -> bool {
        self.single_reads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_parse_and_ports() {
        assert_eq!(Scheme::parse("ftps"), Some(Scheme::Ftps));
        assert_eq!(Scheme::parse("gopher"), None);
        assert_eq!(Scheme::Sftp.default_port(), 22);
        assert_eq!(Scheme::Https.default_port(), 443);
        assert!(!Scheme::Scp.can_retrieve());
        assert!(Scheme::Http.can_retrieve());
    }

    #[test]
    fn multi_read_catches_in_order_and_completes_on_short_block() {
        use crate::machine::mock::MockAdapter;
        let data: Vec<u8> = (0..10u8).collect();
        let mut m = MockAdapter::with_files(&[("f", &data)]);
        m.open_read("f", 0).unwrap();
        let mut mr = MultiRead::init(2, 4);
        let mut out = Vec::new();
        while let Some(block) = mr.catch(&mut m).unwrap() {
            out.extend_from_slice(&block);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn multi_read_discard_falls_back_to_single_reads() {
        use crate::machine::mock::MockAdapter;
        let data = vec![9u8; 6];
        let mut m = MockAdapter::with_files(&[("f", &data)]);
        m.open_read("f", 0).unwrap();
        let mut mr = MultiRead::init(4, 2);
        let first = mr.catch(&mut m).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        mr.discard();
        assert!(mr.is_single_reads());
        let mut rest = Vec::new();
        while let Some(block) = mr.catch(&mut m).unwrap() {
            rest.extend_from_slice(&block);
        }
        // Blocks buffered ahead of the discard are dropped; the remainder
        // still arrives through single reads.
        assert!(rest.len() <= data.len() - 2);
    }

    #[test]
    fn list_size_column_parsing() {
        let line = "-rw-r--r--   1 afd  users    48341 Jan  9 12:00 a.dat";
        assert_eq!(parse_list_size(line, 4), Some(48341));
        assert_eq!(parse_list_size(line, -1), None);
        // Column is not numeric.
        assert_eq!(parse_list_size(line, 2), None);
        // Digits followed by junk stop at the junk.
        assert_eq!(parse_list_size("12x rest", 0), Some(12));
        // Offset beyond the line.
        assert_eq!(parse_list_size("a b", 5), None);
    }
}
