//! FTP and FTPS adapter over suppaftp control/data streams.
//!
//! One adapter serves both schemes; the control connection is either plain
//! or TLS-upgraded at connect time. Appends use APPE rather than REST so a
//! resumed upload never depends on server REST-with-STOR behavior.

use std::io::{Read, Write};
use std::net::ToSocketAddrs;

use suppaftp::native_tls::TlsConnector;
use suppaftp::types::{FileType, FormatControl};
use suppaftp::{FtpError, FtpStream, Mode, NativeTlsConnector, NativeTlsFtpStream};

use crate::error::ProtoError;
use crate::protocol::{
    AuthMethod, ConnectTuning, ProtoResult, ProtocolAdapter, RemoteStat, Scheme, TransferMode,
};

enum Control {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

macro_rules! ctrl {
    ($self:expr, $ftp:ident => $body:expr) => {
        match $self.ctrl.as_mut().ok_or(ProtoError::TransportClosed)? {
            Control::Plain($ftp) => $body,
            Control::Secure($ftp) => $body,
        }
    };
}

pub struct FtpAdapter {
    scheme: Scheme,
    ctrl: Option<Control>,
    data_read: Option<Box<dyn Read + Send>>,
    data_write: Option<Box<dyn Write + Send>>,
    open_path: String,
}

impl FtpAdapter {
    pub fn new(scheme: Scheme) -> Self {
        debug_assert!(matches!(scheme, Scheme::Ftp | Scheme::Ftps));
        Self { scheme, ctrl: None, data_read: None, data_write: None, open_path: String::new() }
    }
}

fn map_ftp_err(e: FtpError) -> ProtoError {
    match e {
        FtpError::UnexpectedResponse(resp) => {
            let code = resp.status.code();
            let body = String::from_utf8_lossy(&resp.body).trim().to_string();
            match code {
                550 => ProtoError::NoSuchFile,
                _ => ProtoError::Status(code, body),
            }
        }
        FtpError::BadResponse => ProtoError::Io("malformed reply".into()),
        FtpError::ConnectionError(ioe) => match ioe.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProtoError::Timeout,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => ProtoError::TransportClosed,
            _ => ProtoError::Io(ioe.to_string()),
        },
        other => ProtoError::Io(other.to_string()),
    }
}

fn map_io_err(path: &str, e: std::io::Error) -> ProtoError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProtoError::Timeout,
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => ProtoError::TransportClosed,
        _ => ProtoError::Io(format!("{}: {}", path, e)),
    }
}

impl ProtocolAdapter for FtpAdapter {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn connect(&mut self, host: &str, tuning: &ConnectTuning) -> ProtoResult<()> {
        let addr_str = format!("{}:{}", host, tuning.port);
        let mut addrs = addr_str
            .to_socket_addrs()
            .map_err(|e| ProtoError::Io(format!("resolve {}: {}", addr_str, e)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| ProtoError::Io(format!("no address for {}", addr_str)))?;
        let mode = if tuning.passive { Mode::Passive } else { Mode::Active };
        match self.scheme {
            Scheme::Ftp => {
                let mut ftp =
                    FtpStream::connect_timeout(addr, tuning.timeout).map_err(map_ftp_err)?;
                let _ = ftp.get_ref().set_read_timeout(Some(tuning.timeout));
                let _ = ftp.get_ref().set_write_timeout(Some(tuning.timeout));
                ftp.set_mode(mode);
                self.ctrl = Some(Control::Plain(ftp));
            }
            _ => {
                let ftp = NativeTlsFtpStream::connect_timeout(addr, tuning.timeout)
                    .map_err(map_ftp_err)?;
                let _ = ftp.get_ref().set_read_timeout(Some(tuning.timeout));
                let _ = ftp.get_ref().set_write_timeout(Some(tuning.timeout));
                let connector = TlsConnector::builder()
                    .danger_accept_invalid_certs(!tuning.tls_strict_verify)
                    .build()
                    .map_err(|e| ProtoError::Io(format!("tls setup: {}", e)))?;
                let mut ftp = ftp
                    .into_secure(NativeTlsConnector::from(connector), host)
                    .map_err(map_ftp_err)?;
                ftp.set_mode(mode);
                self.ctrl = Some(Control::Secure(ftp));
            }
        }
        Ok(())
    }

    fn authenticate(&mut self, user: &str, secret: &str, method: &AuthMethod) -> ProtoResult<()> {
        match method {
            AuthMethod::Password => {
                ctrl!(self, ftp => ftp.login(user, secret).map(|_| ()).map_err(map_ftp_err))
            }
            AuthMethod::PublicKey(_) => {
                Err(ProtoError::Status(502, "key authentication not available over ftp".into()))
            }
            // A proxy chain is a sequence of logins; each step is
            // "user pass" with $U/$P placeholders for the real account.
            AuthMethod::Proxy(steps) => {
                for step in steps {
                    let step = step.replace("$U", user).replace("$P", secret);
                    let mut parts = step.splitn(2, ' ');
                    let u = parts.next().unwrap_or_default();
                    let p = parts.next().unwrap_or_default();
                    ctrl!(self, ftp => ftp.login(u, p).map(|_| ()).map_err(map_ftp_err))?;
                }
                Ok(())
            }
        }
    }

    fn set_transfer_mode(&mut self, mode: TransferMode) -> ProtoResult<()> {
        let ft = match mode {
            TransferMode::Ascii => FileType::Ascii(FormatControl::Default),
            TransferMode::Binary | TransferMode::Dos => FileType::Binary,
        };
        ctrl!(self, ftp => ftp.transfer_type(ft).map_err(map_ftp_err))
    }

    fn pwd(&mut self) -> ProtoResult<String> {
        ctrl!(self, ftp => ftp.pwd().map_err(map_ftp_err))
    }

    fn cd(&mut self, path: &str, create: bool, _mode: u32) -> ProtoResult<Option<String>> {
        let first = ctrl!(self, ftp => ftp.cwd(path).map_err(map_ftp_err));
        match first {
            Ok(()) => Ok(None),
            Err(_e) if create => {
                // CWD failed; build the chain one component at a time, then
                // retry. Existing components answer 550 on MKD, which is fine.
                let mut accum = String::new();
                for seg in path.split('/').filter(|s| !s.is_empty()) {
                    if path.starts_with('/') || !accum.is_empty() {
                        accum.push('/');
                    }
                    accum.push_str(seg);
                    let _ = ctrl!(self, ftp => ftp.mkdir(&accum).map_err(map_ftp_err));
                }
                ctrl!(self, ftp => ftp.cwd(path).map_err(map_ftp_err))?;
                Ok(Some(path.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn stat(&mut self, path: &str) -> ProtoResult<RemoteStat> {
        let size = match ctrl!(self, ftp => ftp.size(path).map_err(map_ftp_err)) {
            Ok(s) => Some(s as u64),
            Err(ProtoError::NoSuchFile) => return Err(ProtoError::NoSuchFile),
            Err(_) => None,
        };
        let mtime = ctrl!(self, ftp => ftp.mdtm(path).map_err(map_ftp_err))
            .ok()
            .map(|dt| dt.and_utc().timestamp());
        Ok(RemoteStat { size, mtime })
    }

    fn list(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        ctrl!(self, ftp => ftp.list(path).map_err(map_ftp_err))
    }

    fn list_names(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        ctrl!(self, ftp => ftp.nlst(path).map_err(map_ftp_err))
    }

    fn open_read(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        if offset > 0 {
            ctrl!(self, ftp => ftp.resume_transfer(offset as usize).map_err(map_ftp_err))?;
        }
        let stream: Box<dyn Read + Send> = match self.ctrl.as_mut().ok_or(ProtoError::TransportClosed)? {
            Control::Plain(ftp) => Box::new(ftp.retr_as_stream(path).map_err(map_ftp_err)?),
            Control::Secure(ftp) => Box::new(ftp.retr_as_stream(path).map_err(map_ftp_err)?),
        };
        self.data_read = Some(stream);
        self.open_path = path.to_string();
        Ok(())
    }

    fn open_write(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        let stream: Box<dyn Write + Send> = match self.ctrl.as_mut().ok_or(ProtoError::TransportClosed)? {
            Control::Plain(ftp) => {
                if offset > 0 {
                    Box::new(ftp.append_with_stream(path).map_err(map_ftp_err)?)
                } else {
                    Box::new(ftp.put_with_stream(path).map_err(map_ftp_err)?)
                }
            }
            Control::Secure(ftp) => {
                if offset > 0 {
                    Box::new(ftp.append_with_stream(path).map_err(map_ftp_err)?)
                } else {
                    Box::new(ftp.put_with_stream(path).map_err(map_ftp_err)?)
                }
            }
        };
        self.data_write = Some(stream);
        self.open_path = path.to_string();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> ProtoResult<usize> {
        let path = self.open_path.clone();
        let r = self
            .data_read
            .as_mut()
            .ok_or_else(|| ProtoError::Io("no open remote file".into()))?;
        r.read(buf).map_err(|e| map_io_err(&path, e))
    }

    fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
        let path = self.open_path.clone();
        let w = self
            .data_write
            .as_mut()
            .ok_or_else(|| ProtoError::Io("no open remote file".into()))?;
        w.write_all(buf).map_err(|e| map_io_err(&path, e))
    }

    fn close(&mut self) -> ProtoResult<()> {
        if let Some(r) = self.data_read.take() {
            ctrl!(self, ftp => ftp.finalize_retr_stream(r).map_err(map_ftp_err))?;
        }
        if let Some(w) = self.data_write.take() {
            ctrl!(self, ftp => ftp.finalize_put_stream(w).map_err(map_ftp_err))?;
        }
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
        let res = ctrl!(self, ftp => ftp.rename(src, dst).map_err(map_ftp_err));
        match res {
            Ok(()) => Ok(None),
            Err(ProtoError::NoSuchFile) if create_parents => {
                let parent: String = match dst.rfind('/') {
                    Some(i) => dst[..i].to_string(),
                    None => return Err(ProtoError::NoSuchFile),
                };
                let created = self.cd(&parent, true, mode)?;
                ctrl!(self, ftp => ftp.rename(src, dst).map_err(map_ftp_err))?;
                Ok(created)
            }
            Err(e) => Err(e),
        }
    }

    fn delete(&mut self, path: &str) -> ProtoResult<()> {
        ctrl!(self, ftp => ftp.rm(path).map_err(map_ftp_err))
    }

    fn set_mtime(&mut self, _path: &str, _mtime: i64) -> ProtoResult<()> {
        Err(ProtoError::Status(502, "MFMT not available".into()))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> ProtoResult<()> {
        let cmd = format!("CHMOD {:o} {}", mode & 0o7777, path);
        ctrl!(self, ftp => ftp.site(&cmd).map(|_| ()).map_err(map_ftp_err))
    }

    fn exec_site(&mut self, cmd: &str) -> ProtoResult<()> {
        ctrl!(self, ftp => ftp.site(cmd).map(|_| ()).map_err(map_ftp_err))
    }

    fn quit(&mut self) -> ProtoResult<()> {
        self.data_read = None;
        self.data_write = None;
        if let Some(mut ctrl) = self.ctrl.take() {
            let res = match &mut ctrl {
                Control::Plain(ftp) => ftp.quit(),
                Control::Secure(ftp) => ftp.quit(),
            };
            res.map_err(map_ftp_err)?;
        }
        Ok(())
    }
}
