//! Shared per-file machinery for the send and fetch state machines:
//! on-wire naming, WMO framing, ASCII translation and append probing.

pub mod fetch;
pub mod send;

use crate::error::ProtoError;
use crate::job::LockStrategy;
use crate::protocol::{ProtoResult, ProtocolAdapter, parse_list_size};
use crate::status::fsa::{FILE_SIZE_OFFSET_AUTO, FILE_SIZE_OFFSET_NONE};

/// Compose the temporary on-wire name for a file. The final rename strips
/// this again.
pub fn on_wire_name(
    final_name: &str,
    lock: &LockStrategy,
    unique_tag: &str,
    sequence: u32,
) -> String {
    match lock {
        LockStrategy::Off | LockStrategy::OffSilent | LockStrategy::LockFile(_) => {
            final_name.to_string()
        }
        LockStrategy::Dot => format!(".{}", final_name),
        LockStrategy::DotVms => format!("{}.", final_name),
        LockStrategy::Postfix(p) => format!("{}{}", final_name, p),
        LockStrategy::Sequence => format!("{}-{}", final_name, sequence),
        LockStrategy::Unique => format!("{}.{}", final_name, unique_tag),
    }
}

/// WMO bulletin framing.
pub const WMO_SOH: &[u8] = b"\x01\r\r\n";
pub const WMO_SEP: &[u8] = b"\r\r\n";
pub const WMO_FOOTER: &[u8] = b"\r\r\n\x03";

/// Derive the bulletin heading from a file name: separators become spaces,
/// the heading ends at the second separator (keeping one trailing 4-byte
/// group when it starts with three letters) or at the first `.`/`;`.
pub fn wmo_heading(file_name: &str) -> String {
    let bytes = file_name.as_bytes();
    let mut out = String::new();
    let mut spaces = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '.' || c == ';' {
            break;
        }
        if c == '_' || c == '-' || c == ' ' {
            spaces += 1;
            if spaces == 2 {
                let alpha3 = i + 3 < bytes.len()
                    && bytes[i + 1].is_ascii_alphabetic()
                    && bytes[i + 2].is_ascii_alphabetic()
                    && bytes[i + 3].is_ascii_alphabetic();
                if alpha3 {
                    out.push(' ');
                    for j in 1..=4 {
                        if i + j >= bytes.len() {
                            break;
                        }
                        let cj = bytes[i + j] as char;
                        if cj == '.' || cj == ';' {
                            break;
                        }
                        out.push(cj);
                    }
                }
                break;
            }
            out.push(' ');
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

/// Bytes written before the payload when WMO framing is on.
pub fn wmo_frame_prefix(file_name: &str) -> Vec<u8> {
    let heading = wmo_heading(file_name);
    let mut buf = Vec::with_capacity(WMO_SOH.len() + heading.len() + WMO_SEP.len());
    buf.extend_from_slice(WMO_SOH);
    buf.extend_from_slice(heading.as_bytes());
    buf.extend_from_slice(WMO_SEP);
    buf
}

/// Total framing overhead for size checks.
pub fn wmo_frame_len(file_name: &str) -> u64 {
    (wmo_frame_prefix(file_name).len() + WMO_FOOTER.len()) as u64
}

/// Scratch buffer for ASCII transfers: LF becomes CRLF, existing CRLF is
/// left alone. Its presence in the send loop is what signals ASCII mode.
pub struct AsciiBuffer {
    buf: Vec<u8>,
}

impl AsciiBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity * 2) }
    }

    pub fn translate(&mut self, input: &[u8]) -> &[u8] {
        self.buf.clear();
        let mut prev = 0u8;
        for &b in input {
            if b == b'\n' && prev != b'\r' {
                self.buf.push(b'\r');
            }
            self.buf.push(b);
            prev = b;
        }
        &self.buf
    }
}

/// Probe the remote size for an append-resume. Prefers the protocol's own
/// size lookup; hosts that only speak LIST get the configured column
/// parsed. Absence of the file means offset 0.
pub fn probe_append_offset(
    adapter: &mut dyn ProtocolAdapter,
    name: &str,
    file_size_offset: i8,
) -> ProtoResult<u64> {
    if file_size_offset == FILE_SIZE_OFFSET_NONE {
        return Ok(0);
    }
    if file_size_offset == FILE_SIZE_OFFSET_AUTO || adapter.supports_append_probe() {
        match adapter.stat(name) {
            Ok(st) => return Ok(st.size.unwrap_or(0)),
            Err(ProtoError::NoSuchFile) => return Ok(0),
            Err(e) if file_size_offset < 0 => return Err(e),
            Err(_) => {}
        }
    }
    // Fall back to the LIST column.
    match adapter.list(Some(name)) {
        Ok(lines) => Ok(lines
            .iter()
            .find_map(|l| parse_list_size(l, file_size_offset))
            .unwrap_or(0)),
        Err(ProtoError::NoSuchFile) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Local temp name during a fetch: dot-prefixed unless the source already
/// hides itself.
pub fn local_temp_name(name: &str) -> String {
    if name.starts_with('.') { name.to_string() } else { format!(".{}", name) }
}

/// Final local name: a leading dot from the source is stripped.
pub fn local_final_name(name: &str) -> &str {
    name.strip_prefix('.').unwrap_or(name)
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory adapter for exercising the state machines.

    use std::collections::BTreeMap;

    use crate::error::ProtoError;
    use crate::protocol::{
        AuthMethod, ConnectTuning, ProtoResult, ProtocolAdapter, RemoteStat, Scheme, TransferMode,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Connect(String),
        Auth(String),
        Mode,
        Pwd,
        Cd(String),
        OpenRead(String, u64),
        OpenWrite(String, u64),
        Close,
        Move(String, String),
        Delete(String),
        Site(String),
        Quit,
    }

    #[derive(Default)]
    pub struct MockAdapter {
        pub files: BTreeMap<String, Vec<u8>>,
        pub calls: Vec<Call>,
        pub fail_user_logins: u32,
        pub read_buf: Option<(Vec<u8>, usize)>,
        pub write_target: Option<String>,
        pub busy_once: Option<String>,
        pub stat_lie: Option<u64>,
        pub cwd: String,
    }

    impl MockAdapter {
        pub fn with_files(files: &[(&str, &[u8])]) -> Self {
            let mut m = Self::default();
            for (n, d) in files {
                m.files.insert((*n).to_string(), d.to_vec());
            }
            m
        }
    }

    impl ProtocolAdapter for MockAdapter {
        fn scheme(&self) -> Scheme {
            Scheme::Sftp
        }

        fn connect(&mut self, host: &str, _tuning: &ConnectTuning) -> ProtoResult<()> {
            self.calls.push(Call::Connect(host.to_string()));
            Ok(())
        }

        fn authenticate(
            &mut self,
            user: &str,
            _secret: &str,
            _method: &AuthMethod,
        ) -> ProtoResult<()> {
            self.calls.push(Call::Auth(user.to_string()));
            if self.fail_user_logins > 0 {
                self.fail_user_logins -= 1;
                return Err(ProtoError::Status(530, "login denied".into()));
            }
            Ok(())
        }

        fn set_transfer_mode(&mut self, _mode: TransferMode) -> ProtoResult<()> {
            self.calls.push(Call::Mode);
            Ok(())
        }

        fn pwd(&mut self) -> ProtoResult<String> {
            self.calls.push(Call::Pwd);
            Ok("/home/afd".to_string())
        }

        fn cd(&mut self, path: &str, _create: bool, _mode: u32) -> ProtoResult<Option<String>> {
            self.calls.push(Call::Cd(path.to_string()));
            self.cwd = path.to_string();
            Ok(None)
        }

        fn stat(&mut self, path: &str) -> ProtoResult<RemoteStat> {
            match self.files.get(path) {
                Some(d) => Ok(RemoteStat {
                    size: Some(self.stat_lie.unwrap_or(d.len() as u64)),
                    mtime: Some(1_700_000_000),
                }),
                None => Err(ProtoError::NoSuchFile),
            }
        }

        fn list(&mut self, _path: Option<&str>) -> ProtoResult<Vec<String>> {
            Ok(self
                .files
                .iter()
                .map(|(n, d)| format!("-rw-r--r-- 1 afd afd {} Jan 1 00:00 {}", d.len(), n))
                .collect())
        }

        fn list_names(&mut self, _path: Option<&str>) -> ProtoResult<Vec<String>> {
            Ok(self.files.keys().cloned().collect())
        }

        fn open_read(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
            self.calls.push(Call::OpenRead(path.to_string(), offset));
            match self.files.get(path) {
                Some(d) => {
                    self.read_buf = Some((d.clone(), offset as usize));
                    Ok(())
                }
                None => Err(ProtoError::NoSuchFile),
            }
        }

        fn open_write(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
            self.calls.push(Call::OpenWrite(path.to_string(), offset));
            if self.busy_once.as_deref() == Some(path) {
                self.busy_once = None;
                return Err(ProtoError::Status(450, "file busy".into()));
            }
            if offset == 0 {
                self.files.insert(path.to_string(), Vec::new());
            }
            self.write_target = Some(path.to_string());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> ProtoResult<usize> {
            let (data, pos) = self
                .read_buf
                .as_mut()
                .ok_or_else(|| ProtoError::Io("no open file".into()))?;
            let n = buf.len().min(data.len().saturating_sub(*pos));
            buf[..n].copy_from_slice(&data[*pos..*pos + n]);
            *pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
            let target = self
                .write_target
                .clone()
                .ok_or_else(|| ProtoError::Io("no open file".into()))?;
            self.files.entry(target).or_default().extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) -> ProtoResult<()> {
            self.calls.push(Call::Close);
            self.read_buf = None;
            self.write_target = None;
            Ok(())
        }

        fn move_file(
            &mut self,
            src: &str,
            dst: &str,
            _create_parents: bool,
            _mode: u32,
        ) -> ProtoResult<Option<String>> {
            self.calls.push(Call::Move(src.to_string(), dst.to_string()));
            match self.files.remove(src) {
                Some(d) => {
                    self.files.insert(dst.to_string(), d);
                    Ok(None)
                }
                None => Err(ProtoError::NoSuchFile),
            }
        }

        fn delete(&mut self, path: &str) -> ProtoResult<()> {
            self.calls.push(Call::Delete(path.to_string()));
            match self.files.remove(path) {
                Some(_) => Ok(()),
                None => Err(ProtoError::NoSuchFile),
            }
        }

        fn set_mtime(&mut self, _path: &str, _mtime: i64) -> ProtoResult<()> {
            Ok(())
        }

        fn chmod(&mut self, _path: &str, _mode: u32) -> ProtoResult<()> {
            Ok(())
        }

        fn exec_site(&mut self, cmd: &str) -> ProtoResult<()> {
            self.calls.push(Call::Site(cmd.to_string()));
            Ok(())
        }

        fn quit(&mut self) -> ProtoResult<()> {
            self.calls.push(Call::Quit);
            Ok(())
        }
    }
}
