//! SCP adapter. Send-only: the retrieve side of this system never runs over
//! SCP, so every read-direction operation answers a protocol status.

use std::io::Write;

use ssh2::Session;

use crate::error::ProtoError;
use crate::protocol::sftp::{auth_ssh, connect_ssh};
use crate::protocol::{
    AuthMethod, ConnectTuning, ProtoResult, ProtocolAdapter, RemoteStat, Scheme, TransferMode,
};

pub struct ScpAdapter {
    sess: Option<Session>,
    channel: Option<ssh2::Channel>,
    open_path: String,
}

impl ScpAdapter {
    pub fn new() -> Self {
        Self { sess: None, channel: None, open_path: String::new() }
    }

    fn unsupported<T>(what: &str) -> ProtoResult<T> {
        Err(ProtoError::Status(502, format!("{} not available over scp", what)))
    }
}

impl Default for ScpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for ScpAdapter {
    fn scheme(&self) -> Scheme {
        Scheme::Scp
    }

    fn connect(&mut self, host: &str, tuning: &ConnectTuning) -> ProtoResult<()> {
        self.sess = Some(connect_ssh(host, tuning)?);
        Ok(())
    }

    fn authenticate(&mut self, user: &str, secret: &str, method: &AuthMethod) -> ProtoResult<()> {
        let sess = self.sess.as_mut().ok_or(ProtoError::TransportClosed)?;
        auth_ssh(sess, user, secret, method)
    }

    fn set_transfer_mode(&mut self, _mode: TransferMode) -> ProtoResult<()> {
        Ok(())
    }

    fn pwd(&mut self) -> ProtoResult<String> {
        // scp paths are always absolute or home-relative on open.
        Ok(String::from("."))
    }

    fn cd(&mut self, _path: &str, _create: bool, _mode: u32) -> ProtoResult<Option<String>> {
        // No directory state; the full path goes into each scp_send.
        Ok(None)
    }

    fn stat(&mut self, _path: &str) -> ProtoResult<RemoteStat> {
        Self::unsupported("stat")
    }

    fn list(&mut self, _path: Option<&str>) -> ProtoResult<Vec<String>> {
        Self::unsupported("list")
    }

    fn list_names(&mut self, _path: Option<&str>) -> ProtoResult<Vec<String>> {
        Self::unsupported("list")
    }

    fn open_read(&mut self, _path: &str, _offset: u64) -> ProtoResult<()> {
        Self::unsupported("retrieve")
    }

    fn open_write(&mut self, _path: &str, _offset: u64) -> ProtoResult<()> {
        Err(ProtoError::Io("scp needs the file size up front".into()))
    }

    fn open_write_sized(&mut self, path: &str, offset: u64, size: Option<u64>) -> ProtoResult<()> {
        if offset > 0 {
            return Err(ProtoError::Status(502, "scp cannot append".into()));
        }
        let size = size.ok_or_else(|| ProtoError::Io("scp needs the file size up front".into()))?;
        let sess = self.sess.as_mut().ok_or(ProtoError::TransportClosed)?;
        let channel = sess
            .scp_send(std::path::Path::new(path), 0o644, size, None)
            .map_err(|e| ProtoError::Io(format!("scp open {}: {}", path, e)))?;
        self.channel = Some(channel);
        self.open_path = path.to_string();
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> ProtoResult<usize> {
        Self::unsupported("read")
    }

    fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
        let path = self.open_path.clone();
        let ch = self
            .channel
            .as_mut()
            .ok_or_else(|| ProtoError::Io("no open remote file".into()))?;
        ch.write_all(buf)
            .map_err(|e| ProtoError::Io(format!("scp write {}: {}", path, e)))
    }

    fn close(&mut self) -> ProtoResult<()> {
        if let Some(mut ch) = self.channel.take() {
            let path = std::mem::take(&mut self.open_path);
            let mut finish = || -> Result<(), ssh2::Error> {
                ch.send_eof()?;
                ch.wait_eof()?;
                ch.close()?;
                ch.wait_close()
            };
            finish().map_err(|e| ProtoError::Io(format!("scp close {}: {}", path, e)))?;
        }
        Ok(())
    }

    fn move_file(
        &mut self,
        _src: &str,
        _dst: &str,
        _create_parents: bool,
        _mode: u32,
    ) -> ProtoResult<Option<String>> {
        Self::unsupported("rename")
    }

    fn delete(&mut self, _path: &str) -> ProtoResult<()> {
        Self::unsupported("delete")
    }

    fn set_mtime(&mut self, _path: &str, _mtime: i64) -> ProtoResult<()> {
        Self::unsupported("set_mtime")
    }

    fn chmod(&mut self, _path: &str, _mode: u32) -> ProtoResult<()> {
        Self::unsupported("chmod")
    }

    fn exec_site(&mut self, _cmd: &str) -> ProtoResult<()> {
        Self::unsupported("SITE")
    }

    fn quit(&mut self) -> ProtoResult<()> {
        self.channel = None;
        if let Some(sess) = self.sess.take() {
            let _ = sess.disconnect(None, "done", None);
        }
        Ok(())
    }

    fn supports_append_probe(&self) -> bool {
        false
    }
}
