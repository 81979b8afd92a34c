/// Repository-wide structured errors for fetch-related operations.
///
/// Every fatal worker path collapses into one of these kinds; the top frame
/// in `main` picks the process exit code from it. Deep call sites only ever
/// propagate `Result`, never exit.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Bad arguments, unreadable job file, malformed URL.
    Incorrect(String),
    /// TCP connect, greeting or login failed.
    ConnectError(String),
    /// LIST failed for a reason other than "no files".
    ListError(String),
    /// Date probe failed with a transient error (not a 500/502 downgrade).
    DateError(String, String),
    /// Size probe failed with a transient error (not a 500/502 downgrade).
    SizeError(String, String),
    /// Could not open or create the local staging file.
    OpenLocalError(std::path::PathBuf, String),
    /// Write or fsync or rename on the staging path failed.
    WriteLocalError(std::path::PathBuf, String),
    /// Read from the remote data channel failed mid-stream.
    ReadRemoteError(String, String),
    /// Remote DELETE after fetch failed.
    DeleteRemoteError(String, String),
    /// The per-file transfer timeout elapsed; work remains assigned.
    StillFilesToSend(String),
    /// Control-channel timeout collapsed the session.
    TimeoutError(String),
    /// mmap / grow / remap failure on a shared region.
    AllocError(String),
    /// A required byte-range lock could not be obtained.
    LockError(String),
    /// The retrieve list does not exist yet and the caller required it.
    StoreUnavailable(String),
    /// Shared table no longer addresses this directory or host.
    StaleHandle(String),
    /// Terminated by signal or supervisor cancel byte.
    GotKilled,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use FetchError::*;
        match self {
            Incorrect(msg) => write!(f, "invalid invocation: {}", msg),
            ConnectError(msg) => write!(f, "could not connect to source: {}", msg),
            ListError(msg) => write!(f, "listing remote directory failed: {}", msg),
            DateError(name, msg) => write!(f, "date probe failed for {}: {}", name, msg),
            SizeError(name, msg) => write!(f, "size probe failed for {}: {}", name, msg),
            OpenLocalError(p, msg) => {
                write!(f, "could not open staging file {}: {}", p.display(), msg)
            }
            WriteLocalError(p, msg) => {
                write!(f, "could not write staging file {}: {}", p.display(), msg)
            }
            ReadRemoteError(name, msg) => write!(f, "remote read failed for {}: {}", name, msg),
            DeleteRemoteError(name, msg) => {
                write!(f, "remote delete failed for {}: {}", name, msg)
            }
            StillFilesToSend(name) => {
                write!(f, "transfer timeout while fetching {}, files still queued", name)
            }
            TimeoutError(msg) => write!(f, "control channel timed out: {}", msg),
            AllocError(msg) => write!(f, "shared region unavailable: {}", msg),
            LockError(msg) => write!(f, "lock acquisition failed: {}", msg),
            StoreUnavailable(alias) => {
                write!(f, "no retrieve list for {} (directory never scanned)", alias)
            }
            StaleHandle(what) => write!(f, "shared table no longer addresses {}", what),
            GotKilled => write!(f, "terminated on request"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Stable process exit code for this error class. Codes are part of the
    /// contract with the supervisor, which keys its respawn policy on them.
    pub fn exit_code(&self) -> i32 {
        use FetchError::*;
        match self {
            Incorrect(_) => 1,
            ConnectError(_) => 10,
            ListError(_) => 11,
            DateError(_, _) => 12,
            SizeError(_, _) => 13,
            OpenLocalError(_, _) => 20,
            WriteLocalError(_, _) => 21,
            ReadRemoteError(_, _) | DeleteRemoteError(_, _) => 22,
            StillFilesToSend(_) => 30,
            TimeoutError(_) => 31,
            AllocError(_) => 40,
            LockError(_) => 41,
            StoreUnavailable(_) => 42,
            StaleHandle(_) => 0,
            GotKilled => 50,
        }
    }

    /// Whether this error is retriable before any data transfer has started
    /// (connect, login, listing). Transient network failures are retriable;
    /// validation and local I/O failures are not.
    pub fn is_retriable_pre_transfer(&self) -> bool {
        use FetchError::*;
        match self {
            // retriable: transient connection/session issues
            ConnectError(_) | TimeoutError(_) | ListError(_) => true,
            // non-retriable: validation / local environment errors
            Incorrect(_)
            | OpenLocalError(_, _)
            | WriteLocalError(_, _)
            | AllocError(_)
            | LockError(_)
            | StoreUnavailable(_)
            | StaleHandle(_)
            | GotKilled => false,
            // fallback: treat unknown/generic as non-retriable by default
            _ => false,
        }
    }

    /// Whether this error is retriable while a file body is streaming.
    /// The session survives a single failed file; the entry stays assigned
    /// and is retried on the next cycle.
    pub fn is_retriable_during_transfer(&self) -> bool {
        use FetchError::*;
        match self {
            ReadRemoteError(_, _) | TimeoutError(_) | StillFilesToSend(_) => true,
            Incorrect(_)
            | OpenLocalError(_, _)
            | WriteLocalError(_, _)
            | AllocError(_)
            | LockError(_)
            | StoreUnavailable(_)
            | StaleHandle(_)
            | GotKilled => false,
            _ => false,
        }
    }

    /// Map an anyhow error back to the fetch kind it wraps, if any.
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&FetchError> {
        err.downcast_ref::<FetchError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(FetchError::Incorrect("x".into()).exit_code(), 1);
        assert_eq!(FetchError::ConnectError("x".into()).exit_code(), 10);
        assert_eq!(FetchError::StillFilesToSend("f".into()).exit_code(), 30);
        assert_eq!(FetchError::GotKilled.exit_code(), 50);
    }

    #[test]
    fn connect_is_retriable_before_transfer_only() {
        let e = FetchError::ConnectError("refused".into());
        assert!(e.is_retriable_pre_transfer());
        assert!(!e.is_retriable_during_transfer());
    }

    #[test]
    fn local_write_is_never_retriable() {
        let e = FetchError::WriteLocalError("/tmp/x".into(), "enospc".into());
        assert!(!e.is_retriable_pre_transfer());
        assert!(!e.is_retriable_during_transfer());
    }
}
