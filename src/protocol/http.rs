//! HTTP(S) adapter over a blocking ureq agent.
//!
//! HTTP has no session or directory state; `cd` only records the path
//! prefix, uploads buffer the body and PUT it on close, and listings come
//! from href extraction on an index page. Rename and SITE answer 501.

use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::ProtoError;
use crate::protocol::{
    AuthMethod, ConnectTuning, ProtoResult, ProtocolAdapter, RemoteStat, Scheme, TransferMode,
};

pub struct HttpAdapter {
    scheme: Scheme,
    agent: Option<ureq::Agent>,
    base: String,
    cur_dir: String,
    auth_header: Option<String>,
    reader: Option<Box<dyn Read + Send>>,
    write_buf: Option<Vec<u8>>,
    write_path: String,
}

impl HttpAdapter {
    pub fn new(scheme: Scheme) -> Self {
        debug_assert!(matches!(scheme, Scheme::Http | Scheme::Https));
        Self {
            scheme,
            agent: None,
            base: String::new(),
            cur_dir: String::new(),
            auth_header: None,
            reader: None,
            write_buf: None,
            write_path: String::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else if self.cur_dir.is_empty() {
            format!("{}/{}", self.base, path)
        } else {
            format!("{}{}/{}", self.base, self.cur_dir, path)
        }
    }

    fn request(&self, method: &str, url: &str) -> ProtoResult<ureq::Request> {
        let agent = self.agent.as_ref().ok_or(ProtoError::TransportClosed)?;
        let mut req = agent.request(method, url);
        if let Some(h) = &self.auth_header {
            req = req.set("Authorization", h);
        }
        Ok(req)
    }
}

fn map_http_err(e: ureq::Error) -> ProtoError {
    match e {
        ureq::Error::Status(404, _) | ureq::Error::Status(410, _) => ProtoError::NoSuchFile,
        ureq::Error::Status(code, resp) => {
            ProtoError::Status(code as u32, resp.status_text().to_string())
        }
        ureq::Error::Transport(t) => {
            let msg = t.to_string();
            if msg.contains("timed out") || msg.contains("timeout") {
                ProtoError::Timeout
            } else {
                ProtoError::Io(msg)
            }
        }
    }
}

impl ProtocolAdapter for HttpAdapter {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn connect(&mut self, host: &str, tuning: &ConnectTuning) -> ProtoResult<()> {
        self.base = format!("{}://{}:{}", self.scheme, host, tuning.port);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(tuning.timeout)
            .timeout_read(tuning.timeout)
            .timeout_write(tuning.timeout)
            .build();
        self.agent = Some(agent);
        Ok(())
    }

    fn authenticate(&mut self, user: &str, secret: &str, method: &AuthMethod) -> ProtoResult<()> {
        match method {
            AuthMethod::Password => {
                if !user.is_empty() {
                    let token = BASE64.encode(format!("{}:{}", user, secret));
                    self.auth_header = Some(format!("Basic {}", token));
                }
                Ok(())
            }
            AuthMethod::PublicKey(_) => {
                Err(ProtoError::Status(501, "key authentication not available over http".into()))
            }
            AuthMethod::Proxy(_) => {
                Err(ProtoError::Status(501, "proxy login not available over http".into()))
            }
        }
    }

    fn set_transfer_mode(&mut self, _mode: TransferMode) -> ProtoResult<()> {
        Ok(())
    }

    fn pwd(&mut self) -> ProtoResult<String> {
        Ok(if self.cur_dir.is_empty() { "/".to_string() } else { self.cur_dir.clone() })
    }

    fn cd(&mut self, path: &str, _create: bool, _mode: u32) -> ProtoResult<Option<String>> {
        // Just a prefix; the server has no directory session to move.
        let mut p = path.trim_end_matches('/').to_string();
        if !p.is_empty() && !p.starts_with('/') {
            p = format!("{}/{}", self.cur_dir, p);
        }
        self.cur_dir = p;
        Ok(None)
    }

    fn stat(&mut self, path: &str) -> ProtoResult<RemoteStat> {
        let url = self.url(path);
        let resp = self.request("HEAD", &url)?.call().map_err(map_http_err)?;
        let size = resp.header("Content-Length").and_then(|v| v.parse::<u64>().ok());
        let mtime = resp
            .header("Last-Modified")
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.timestamp());
        Ok(RemoteStat { size, mtime })
    }

    fn list(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        let dir = path.unwrap_or("");
        let url = if dir.is_empty() {
            format!("{}{}/", self.base, self.cur_dir)
        } else {
            self.url(dir)
        };
        let body = self
            .request("GET", &url)?
            .call()
            .map_err(map_http_err)?
            .into_string()
            .map_err(|e| ProtoError::Io(e.to_string()))?;
        Ok(body.lines().map(|l| l.to_string()).collect())
    }

    fn list_names(&mut self, path: Option<&str>) -> ProtoResult<Vec<String>> {
        // Index pages only; every non-nested href that is not a query or
        // parent link counts as a file name.
        let lines = self.list(path)?;
        let href = regex::Regex::new(r#"href="([^"/?#]+)""#)
            .map_err(|e| ProtoError::Io(e.to_string()))?;
        let mut names = Vec::new();
        for line in &lines {
            for cap in href.captures_iter(line) {
                let name = cap[1].to_string();
                if name != "." && name != ".." {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn open_read(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        let url = self.url(path);
        let mut req = self.request("GET", &url)?;
        if offset > 0 {
            req = req.set("Range", &format!("bytes={}-", offset));
        }
        let resp = req.call().map_err(map_http_err)?;
        self.reader = Some(Box::new(resp.into_reader()));
        Ok(())
    }

    fn open_write(&mut self, path: &str, offset: u64) -> ProtoResult<()> {
        if offset > 0 {
            return Err(ProtoError::Status(501, "ranged PUT not supported".into()));
        }
        self.write_buf = Some(Vec::new());
        self.write_path = path.to_string();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> ProtoResult<usize> {
        let r = self
            .reader
            .as_mut()
            .ok_or_else(|| ProtoError::Io("no open remote file".into()))?;
        r.read(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock
            {
                ProtoError::Timeout
            } else {
                ProtoError::Io(e.to_string())
            }
        })
    }

    fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
        let b = self
            .write_buf
            .as_mut()
            .ok_or_else(|| ProtoError::Io("no open remote file".into()))?;
        b.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) -> ProtoResult<()> {
        self.reader = None;
        if let Some(body) = self.write_buf.take() {
            let path = std::mem::take(&mut self.write_path);
            let url = self.url(&path);
            self.request("PUT", &url)?
                .send_bytes(&body)
                .map_err(map_http_err)?;
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
        Err(ProtoError::Status(501, "rename not available over http".into()))
    }

    fn delete(&mut self, path: &str) -> ProtoResult<()> {
        let url = self.url(path);
        self.request("DELETE", &url)?.call().map_err(map_http_err)?;
        Ok(())
    }

    fn set_mtime(&mut self, _path: &str, _mtime: i64) -> ProtoResult<()> {
        Err(ProtoError::Status(501, "set_mtime not available over http".into()))
    }

    fn chmod(&mut self, _path: &str, _mode: u32) -> ProtoResult<()> {
        Err(ProtoError::Status(501, "chmod not available over http".into()))
    }

    fn exec_site(&mut self, _cmd: &str) -> ProtoResult<()> {
        Err(ProtoError::Status(501, "SITE not available over http".into()))
    }

    fn quit(&mut self) -> ProtoResult<()> {
        self.reader = None;
        self.write_buf = None;
        self.agent = None;
        Ok(())
    }
}
