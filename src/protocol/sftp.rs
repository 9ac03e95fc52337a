//! SFTP adapter over libssh2 sessions.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

use ssh2::{FileStat, OpenFlags, OpenType, RenameFlags, Session};

use crate::error::ProtoError;
use crate::protocol::{
    AuthMethod, ConnectTuning, ProtoResult, ProtocolAdapter, RemoteStat, Scheme, TransferMode,
};

pub struct SftpAdapter {
    sess: Option<Session>,
    sftp: Option<ssh2::Sftp>,
    file: Option<ssh2::File>,
    open_path: String,
}

impl SftpAdapter {
    pub fn new() -> Self {
        Self { sess: None, sftp: None, file: None, open_path: String::new() }
    }

    fn sess(&mut self) -> ProtoResult<&mut Session> {
        self.sess.as_mut().ok_or(ProtoError::TransportClosed)
    }

    fn sftp(&mut self) -> ProtoResult<&ssh2::Sftp> {
        if self.sftp.is_none() {
            let sess = self.sess.as_mut().ok_or(ProtoError::TransportClosed)?;
            let sftp = sess.sftp().map_err(map_ssh_err)?;
            self.sftp = Some(sftp);
        }
        Ok(self.sftp.as_ref().unwrap())
    }

    fn file(&mut self) -> ProtoResult<&mut ssh2::File> {
        self.file.as_mut().ok_or_else(|| ProtoError::Io("no open remote file".into()))
    }
}

impl Default for SftpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn map_ssh_err(e: ssh2::Error) -> ProtoError {
    match e.code() {
        ssh2::ErrorCode::SFTP(2) => ProtoError::NoSuchFile,
        ssh2::ErrorCode::Session(err_code::LIBSSH2_ERROR_TIMEOUT) => ProtoError::Timeout,
        ssh2::ErrorCode::Session(err_code::LIBSSH2_ERROR_SOCKET_SEND)
        | ssh2::ErrorCode::Session(err_code::LIBSSH2_ERROR_SOCKET_RECV)
        | ssh2::ErrorCode::Session(err_code::LIBSSH2_ERROR_SOCKET_DISCONNECT) => {
            ProtoError::TransportClosed
        }
        _ => ProtoError::Io(e.to_string()),
    }
}

// libssh2 error constants used in mapping; the ssh2 crate re-exports the
// raw sys codes through `ErrorCode::Session`.
mod err_code {
    pub const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
    pub const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
    pub const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
    pub const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
}

/// Dial and handshake an SSH session. Shared by the SFTP and SCP adapters.
pub(crate) fn connect_ssh(host: &str, tuning: &ConnectTuning) -> ProtoResult<Session> {
    let addr = format!("{}:{}", host, tuning.port);
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| ProtoError::Io(format!("resolve {}: {}", addr, e)))?;
    let sock = addrs
        .next()
        .ok_or_else(|| ProtoError::Io(format!("no address for {}", addr)))?;
    let tcp = TcpStream::connect_timeout(&sock, tuning.timeout)
        .map_err(|e| ProtoError::Io(format!("connect {}: {}", addr, e)))?;
    let _ = tcp.set_read_timeout(Some(tuning.timeout));
    let _ = tcp.set_write_timeout(Some(tuning.timeout));
    let mut sess =
        Session::new().map_err(|e| ProtoError::Io(format!("session for {}: {}", addr, e)))?;
    sess.set_tcp_stream(tcp);
    sess.handshake().map_err(map_ssh_err)?;
    sess.set_timeout(tuning.timeout.as_millis() as u32);
    if tuning.tcp_keepalive {
        sess.set_keepalive(true, 30);
    }
    Ok(sess)
}

/// Authenticate an SSH session with the configured material.
pub(crate) fn auth_ssh(
    sess: &mut Session,
    user: &str,
    secret: &str,
    method: &AuthMethod,
) -> ProtoResult<()> {
    match method {
        AuthMethod::Password => {
            sess.userauth_password(user, secret).map_err(map_ssh_err)?;
        }
        AuthMethod::PublicKey(key) => {
            let pass = if secret.is_empty() { None } else { Some(secret) };
            sess.userauth_pubkey_file(user, None, key, pass).map_err(map_ssh_err)?;
        }
        AuthMethod::Proxy(_) => {
            return Err(ProtoError::Status(502, "proxy login not available over ssh".into()));
        }
    }
    if sess.authenticated() {
        Ok(())
    } else {
        Err(ProtoError::Status(530, "authentication incomplete".into()))
    }
}

/// Walk `dir` creating missing components. Racing creators are tolerated:
/// a failed mkdir followed by a successful stat means someone else won.
fn mkdir_parents(sftp: &ssh2::Sftp, dir: &Path, mode: u32) -> ProtoResult<Option<String>> {
    let mut accum = PathBuf::new();
    let mut created = None;
    for comp in dir.components() {
        use std::path::Component;
        match comp {
            Component::RootDir => accum.push("/"),
            Component::Normal(seg) => accum.push(seg),
            _ => continue,
        }
        let p = accum.as_path();
        if p.as_os_str().is_empty() {
            continue;
        }
        if sftp.stat(p).is_err() {
            match sftp.mkdir(p, mode as i32) {
                Ok(()) => created = Some(p.to_string_lossy().to_string()),
                Err(e) => {
                    if sftp.stat(p).is_err() {
                        return Err(map_ssh_err(e));
                    }
                }
            }
        }
    }
    Ok(created)
}

impl ProtocolAdapter for SftpAdapter {
    fn scheme(&self) -> Scheme {
        Scheme::Sftp
    }

    fn connect(&mut self, host: &str, tuning: &ConnectTuning) -> ProtoResult<()> {
        self.sess = Some(connect_ssh(host, tuning)?);
        Ok(())
    }

    fn authenticate(&mut self, user: &str, secret: &str, method: &AuthMethod) -> ProtoResult<()> {
        let sess = self.sess()?;
        auth_ssh(sess, user, secret, method)
    }

    fn set_transfer_mode(&mut self, _mode: TransferMode) -> ProtoResult<()> {
        // Byte-transparent; translation happens in the send loop.
        Ok(())
    }

    fn pwd(&mut self) -> ProtoResult<String> {
        let sftp = self.sftp()?;
        let p = sftp.realpath(Path::new(".")).map_err(map_ssh_err)?;
        Ok(p.to_string_lossy().to_string())
    }

    fn cd(&mut self, path: &str, create: bool, mode: u32) -> ProtoResult<Option<String>> {
        let sftp = self.sftp()?;
        match sftp.stat(Path::new(path)) {
            Ok(_) => Ok(None),
            Err(e) => {
                if create {
                    mkdir_parents(sftp, Path::new(path), mode)
                } else {
                    Err(map_ssh_err(e))
                }
            }
        }
    }

    fn stat(&mut self, path: &str) -> ProtoResult<RemoteStat> {
        let sftp = self.sftp()?;
        let st = sftp.stat(Path::new(path)).map_err(map_ssh_err)?;
        Ok(RemoteStat { size: st.size, mtime: st.mtime.map(|m| m as i64) })
    }

    fn list(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        let sftp = self.sftp()?;
        let dir = Path::new(path.unwrap_or("."));
        let entries = sftp.readdir(dir).map_err(map_ssh_err)?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, st)| {
                let name = p.file_name()?.to_string_lossy().to_string();
                Some(format!(
                    "{} {} {}",
                    name,
                    st.size.unwrap_or(0),
                    st.mtime.unwrap_or(0)
                ))
            })
            .collect())
    }

    fn list_names(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        let sftp = self.sftp()?;
        let dir = Path::new(path.unwrap_or("."));
        let entries = sftp.readdir(dir).map_err(map_ssh_err)?;
        Ok(entries
            .into_iter()
            .filter(|(_, st)| st.is_file())
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    fn open_read(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        let sftp = self.sftp()?;
        let mut f = sftp.open(Path::new(path)).map_err(map_ssh_err)?;
        if offset > 0 {
            f.seek(SeekFrom::Start(offset))
                .map_err(|e| ProtoError::Io(format!("seek {}: {}", path, e)))?;
        }
        self.file = Some(f);
        self.open_path = path.to_string();
        Ok(())
    }

    fn open_write(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        let sftp = self.sftp()?;
        let flags = if offset == 0 {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        } else {
            OpenFlags::WRITE | OpenFlags::CREATE
        };
        let mut f = sftp
            .open_mode(Path::new(path), flags, 0o644, OpenType::File)
            .map_err(map_ssh_err)?;
        if offset > 0 {
            f.seek(SeekFrom::Start(offset))
                .map_err(|e| ProtoError::Io(format!("seek {}: {}", path, e)))?;
        }
        self.file = Some(f);
        self.open_path = path.to_string();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> ProtoResult<usize> {
        let path = self.open_path.clone();
        self.file()?
            .read(buf)
            .map_err(|e| ProtoError::Io(format!("read {}: {}", path, e)))
    }

    fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
        let path = self.open_path.clone();
        self.file()?
            .write_all(buf)
            .map_err(|e| ProtoError::Io(format!("write {}: {}", path, e)))
    }

    fn close(&mut self) -> ProtoResult<()> {
        self.file = None;
        self.open_path.clear();
        Ok(())
    }

    fn move_file(
        &mut self,
        src: &str,
        dst: &str,
        create_parents: bool,
        mode: u32,
    ) -> ProtoResult<Option<String>> {
        let sftp = self.sftp()?;
        let mut created = None;
        if create_parents
            && let Some(parent) = Path::new(dst).parent()
        {
            created = mkdir_parents(sftp, parent, mode)?;
        }
        sftp.rename(Path::new(src), Path::new(dst), Some(RenameFlags::OVERWRITE))
            .map_err(map_ssh_err)?;
        Ok(created)
    }

    fn delete(&mut self, path: &str) -> ProtoResult<()> {
        let sftp = self.sftp()?;
        sftp.unlink(Path::new(path)).map_err(map_ssh_err)
    }

    fn set_mtime(&mut self, path: &str, mtime: i64) -> ProtoResult<()> {
        let sftp = self.sftp()?;
        let st = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(mtime as u64),
            mtime: Some(mtime as u64),
        };
        sftp.setstat(Path::new(path), st).map_err(map_ssh_err)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> ProtoResult<()> {
        let sftp = self.sftp()?;
        let st = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        sftp.setstat(Path::new(path), st).map_err(map_ssh_err)
    }

    fn exec_site(&mut self, _cmd: &str) -> ProtoResult<()> {
        Err(ProtoError::Status(502, "SITE not available over sftp".into()))
    }

    fn quit(&mut self) -> ProtoResult<()> {
        self.file = None;
        self.sftp = None;
        if let Some(sess) = self.sess.take() {
            let _ = sess.disconnect(None, "done", None);
        }
        Ok(())
    }

    fn supports_multi_read(&self) -> bool {
        true
    }
}
