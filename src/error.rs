/// Structured errors and exit statuses for the transfer workers.
///
/// Workers are short-lived processes spawned by the dispatcher; the exit
/// status is the primary error channel back to it. Every failure path in the
/// crate funnels into a `WorkerError`, and `WorkerError::status()` yields the
/// process exit code the dispatcher acts on.

/// Process exit statuses understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    TransferSuccess = 0,
    ConnectError = 1,
    AuthError = 2,
    UserError = 3,
    PasswordError = 4,
    TypeError = 5,
    ChdirError = 6,
    OpenRemoteError = 10,
    WriteRemoteError = 11,
    ReadRemoteError = 12,
    CloseRemoteError = 13,
    MoveRemoteError = 14,
    DeleteRemoteError = 15,
    WriteLockError = 16,
    RemoveLockfileError = 17,
    StatTargetError = 18,
    FileSizeMatchError = 19,
    OpenLocalError = 20,
    ReadLocalError = 21,
    WriteLocalError = 22,
    AllocError = 23,
    TimeoutError = 24,
    StillFilesToSend = 25,
    GotKilled = 30,
    Incorrect = 31,
}

impl WorkerStatus {
    pub fn code(self) -> i32 {
        self as u8 as i32
    }

    /// Statuses the dispatcher treats as "requeue, files remain" rather than
    /// a host-level failure.
    pub fn is_requeue(self) -> bool {
        matches!(self, WorkerStatus::StillFilesToSend)
    }
}

/// Result of a single protocol operation (connect, cd, open, read, ...).
///
/// `Status` carries the protocol reply code verbatim so callers can
/// distinguish retryable conditions (e.g. an FTP 421 idle disconnect) from
/// hard failures without each adapter growing its own taxonomy.
#[derive(Debug, Clone)]
pub enum ProtoError {
    /// Protocol-level reply: numeric code plus server text.
    Status(u32, String),
    /// The per-operation timeout expired.
    Timeout,
    /// The named remote file does not exist.
    NoSuchFile,
    /// The transport dropped underneath us (EPIPE, reset, EOF on control).
    TransportClosed,
    /// Transport or local I/O error with no protocol reply.
    Io(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::Status(code, msg) => write!(f, "remote replied {}: {}", code, msg),
            ProtoError::Timeout => write!(f, "operation timed out"),
            ProtoError::NoSuchFile => write!(f, "no such file on remote"),
            ProtoError::TransportClosed => write!(f, "transport closed"),
            ProtoError::Io(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for ProtoError {}

impl ProtoError {
    /// Whether this error means "the control connection idled out" and the
    /// remaining files should be requeued instead of failing the host.
    pub fn is_idle_disconnect(&self) -> bool {
        match self {
            // 421: service closing control connection (FTP); other schemes
            // surface the same condition as a closed transport.
            ProtoError::Status(code, _) => *code == 421,
            ProtoError::TransportClosed => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtoError::Timeout)
    }
}

/// Worker-level failures, each tied to the exit status the dispatcher sees.
#[derive(Debug, Clone)]
pub enum WorkerError {
    Connect(String, ProtoError),
    Auth(String, ProtoError),
    User(String, ProtoError),
    Password(String, ProtoError),
    TypeSet(String, ProtoError),
    Chdir(String, ProtoError),
    OpenRemote(String, ProtoError),
    WriteRemote(String, ProtoError),
    ReadRemote(String, ProtoError),
    CloseRemote(String, ProtoError),
    MoveRemote(String, String, ProtoError),
    DeleteRemote(String, ProtoError),
    WriteLock(String, ProtoError),
    RemoveLockfile(String, ProtoError),
    StatTarget(String, ProtoError),
    /// Remote size after close disagreed with what was streamed.
    SizeMismatch {
        file: String,
        expected: u64,
        got: u64,
    },
    OpenLocal(String, String),
    ReadLocal(String, String),
    WriteLocal(String, String),
    Alloc(String),
    /// Per-file transfer timeout or leftover work; the dispatcher requeues.
    StillFilesToSend,
    GotKilled,
    Incorrect(String),
    /// The mapped status area was recreated underneath us; re-attach needed.
    StaleMapping(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use WorkerError::*;
        match self {
            Connect(host, e) => write!(f, "failed to connect to {}: {}", host, e),
            Auth(host, e) => write!(f, "authentication failed on {}: {}", host, e),
            User(host, e) => write!(f, "remote rejected user on {}: {}", host, e),
            Password(host, e) => write!(f, "remote rejected password on {}: {}", host, e),
            TypeSet(host, e) => write!(f, "failed to set transfer type on {}: {}", host, e),
            Chdir(dir, e) => write!(f, "failed to change to remote directory {}: {}", dir, e),
            OpenRemote(p, e) => write!(f, "failed to open remote file {}: {}", p, e),
            WriteRemote(p, e) => write!(f, "failed to write remote file {}: {}", p, e),
            ReadRemote(p, e) => write!(f, "failed to read remote file {}: {}", p, e),
            CloseRemote(p, e) => write!(f, "failed to close remote file {}: {}", p, e),
            MoveRemote(s, d, e) => write!(f, "failed to rename {} to {} on remote: {}", s, d, e),
            DeleteRemote(p, e) => write!(f, "failed to delete remote file {}: {}", p, e),
            WriteLock(p, e) => write!(f, "failed to write remote lock file {}: {}", p, e),
            RemoveLockfile(p, e) => write!(f, "failed to remove remote lock file {}: {}", p, e),
            StatTarget(p, e) => write!(f, "failed to stat remote file {}: {}", p, e),
            SizeMismatch { file, expected, got } => write!(
                f,
                "size mismatch for {}: sent {} bytes but remote reports {}",
                file, expected, got
            ),
            OpenLocal(p, e) => write!(f, "failed to open local file {}: {}", p, e),
            ReadLocal(p, e) => write!(f, "failed to read local file {}: {}", p, e),
            WriteLocal(p, e) => write!(f, "failed to write local file {}: {}", p, e),
            Alloc(what) => write!(f, "allocation failed: {}", what),
            StillFilesToSend => write!(f, "files remain to be sent"),
            GotKilled => write!(f, "worker was killed"),
            Incorrect(what) => write!(f, "inconsistent worker state: {}", what),
            StaleMapping(area) => write!(f, "status area {} was recreated; stale mapping", area),
        }
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    /// Exit status the dispatcher sees for this failure, before timeout
    /// escalation.
    pub fn status(&self) -> WorkerStatus {
        use WorkerError::*;
        match self {
            Connect(_, _) => WorkerStatus::ConnectError,
            Auth(_, _) => WorkerStatus::AuthError,
            User(_, _) => WorkerStatus::UserError,
            Password(_, _) => WorkerStatus::PasswordError,
            TypeSet(_, _) => WorkerStatus::TypeError,
            Chdir(_, _) => WorkerStatus::ChdirError,
            OpenRemote(_, _) => WorkerStatus::OpenRemoteError,
            WriteRemote(_, _) => WorkerStatus::WriteRemoteError,
            ReadRemote(_, _) => WorkerStatus::ReadRemoteError,
            CloseRemote(_, _) => WorkerStatus::CloseRemoteError,
            MoveRemote(_, _, _) => WorkerStatus::MoveRemoteError,
            DeleteRemote(_, _) => WorkerStatus::DeleteRemoteError,
            WriteLock(_, _) => WorkerStatus::WriteLockError,
            RemoveLockfile(_, _) => WorkerStatus::RemoveLockfileError,
            StatTarget(_, _) => WorkerStatus::StatTargetError,
            SizeMismatch { .. } => WorkerStatus::FileSizeMatchError,
            OpenLocal(_, _) => WorkerStatus::OpenLocalError,
            ReadLocal(_, _) => WorkerStatus::ReadLocalError,
            WriteLocal(_, _) => WorkerStatus::WriteLocalError,
            Alloc(_) => WorkerStatus::AllocError,
            StillFilesToSend => WorkerStatus::StillFilesToSend,
            GotKilled => WorkerStatus::GotKilled,
            Incorrect(_) => WorkerStatus::Incorrect,
            // A stale mapping after cleanup is a quiet success; the slot no
            // longer belongs to us and the dispatcher already moved on.
            StaleMapping(_) => WorkerStatus::TransferSuccess,
        }
    }

    /// Escalate to the timeout status when the underlying protocol error was
    /// a timeout. Mirrors the dispatcher contract: a timed-out open is
    /// reported as a timeout, not as an open failure.
    pub fn eval_timeout(&self) -> WorkerStatus {
        if self.proto().map(ProtoError::is_timeout).unwrap_or(false) {
            WorkerStatus::TimeoutError
        } else {
            self.status()
        }
    }

    fn proto(&self) -> Option<&ProtoError> {
        use WorkerError::*;
        match self {
            Connect(_, e) | Auth(_, e) | User(_, e) | Password(_, e) | TypeSet(_, e)
            | Chdir(_, e) | OpenRemote(_, e) | WriteRemote(_, e) | ReadRemote(_, e)
            | CloseRemote(_, e) | DeleteRemote(_, e) | WriteLock(_, e) | RemoveLockfile(_, e)
            | StatTarget(_, e) => Some(e),
            MoveRemote(_, _, e) => Some(e),
            _ => None,
        }
    }

    /// Whether the failure happened before any data moved and a fresh
    /// connection attempt could succeed. Auth and validation failures are
    /// not retriable; transient transport failures are.
    pub fn is_retriable_pre_transfer(&self) -> bool {
        use WorkerError::*;
        match self {
            Connect(_, e) | Chdir(_, e) | TypeSet(_, e) => {
                !matches!(e, ProtoError::Status(code, _) if *code >= 500)
            }
            Auth(_, _) | User(_, _) | Password(_, _) => false,
            _ => false,
        }
    }

    /// A broken-pipe write means the far end is gone; a polite QUIT would
    /// only block.
    pub fn skips_quit(&self) -> bool {
        matches!(
            self,
            WorkerError::WriteRemote(_, ProtoError::TransportClosed)
                | WorkerError::ReadRemote(_, ProtoError::TransportClosed)
        )
    }

    /// Whether a failure during streaming warrants requeueing the remaining
    /// files instead of marking the host broken.
    pub fn is_requeue_worthy(&self) -> bool {
        use WorkerError::*;
        match self {
            StillFilesToSend => true,
            WriteRemote(_, e) | ReadRemote(_, e) | CloseRemote(_, e) | OpenRemote(_, e) => {
                e.is_idle_disconnect()
            }
            _ => false,
        }
    }
}

/// Errors from the retrieve-list store.
#[derive(Debug, Clone)]
pub enum RetrieveListError {
    /// Another worker claimed the entry first.
    AlreadyClaimed(usize),
    /// Index outside the mapped entry table.
    OutOfRange(usize),
    Io(String),
}

impl std::fmt::Display for RetrieveListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrieveListError::AlreadyClaimed(i) => {
                write!(f, "retrieve-list entry {} already claimed", i)
            }
            RetrieveListError::OutOfRange(i) => {
                write!(f, "retrieve-list index {} out of range", i)
            }
            RetrieveListError::Io(msg) => write!(f, "retrieve-list I/O error: {}", msg),
        }
    }
}

impl std::error::Error for RetrieveListError {}

/// Errors from the shared status areas.
#[derive(Debug, Clone)]
pub enum StatusAreaError {
    /// The backing file was recreated; callers must re-attach and re-locate
    /// their slot before touching counters again.
    StaleMapping(String),
    /// The file is smaller than its own header claims.
    Truncated(String),
    BadMagic(String),
    Io(String),
}

impl std::fmt::Display for StatusAreaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusAreaError::StaleMapping(area) => {
                write!(f, "status area {} id changed; mapping is stale", area)
            }
            StatusAreaError::Truncated(area) => {
                write!(f, "status area {} shorter than header claims", area)
            }
            StatusAreaError::BadMagic(area) => {
                write!(f, "status area {} has wrong magic/version", area)
            }
            StatusAreaError::Io(msg) => write!(f, "status area I/O error: {}", msg),
        }
    }
}

impl std::error::Error for StatusAreaError {}

impl From<StatusAreaError> for WorkerError {
    fn from(e: StatusAreaError) -> Self {
        match e {
            StatusAreaError::StaleMapping(area) => WorkerError::StaleMapping(area),
            other => WorkerError::Incorrect(other.to_string()),
        }
    }
}
