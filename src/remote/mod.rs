//! Session-side view of a remote source directory.
//!
//! Scan and fetch drive a `RemoteSource` object instead of a concrete
//! protocol client, so the same core serves any pull protocol offering a
//! listing, per-name metadata probes and ranged reads. The bundled
//! implementation lives in `ftp.rs`; tests substitute a scripted source.

mod ftp;

pub use ftp::{FtpSource, SessionConfig};

use anyhow::Result;

/// Result of a per-name metadata probe.
///
/// `NotSupported` is sticky for the session and is not an error; the
/// caller downgrades to "unknown size/date" and carries on. Transient
/// failures surface as `Err` and must not flip the capability flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe<T> {
    Known(T),
    NotSupported,
}

/// One connected session against a source directory.
pub trait RemoteSource {
    /// Names in the remote directory, one per entry, `./` prefixes intact
    /// (the scan layer strips them).
    fn list(&mut self) -> Result<Vec<String>>;

    /// Modification time probe, unix seconds.
    fn mtime(&mut self, name: &str) -> Result<Probe<i64>>;

    /// Size probe, bytes.
    fn size(&mut self, name: &str) -> Result<Probe<i64>>;

    /// Open the body for reading, starting at `offset` (0 = whole file).
    fn retrieve(&mut self, name: &str, offset: i64) -> Result<Box<dyn std::io::Read + Send>>;

    /// Collect the end-of-transfer acknowledgement after the stream from
    /// [`RemoteSource::retrieve`] has been drained or abandoned.
    fn retrieve_done(&mut self) -> Result<()>;

    /// Delete a remote file (post-fetch removal and the stale/unknown
    /// cleanup rules).
    fn delete(&mut self, name: &str) -> Result<()>;

    /// Keep-alive ping issued by the arbiter between scan cycles.
    fn noop(&mut self) -> Result<()>;

    /// Orderly session end.
    fn quit(&mut self) -> Result<()>;

    /// Capability flags, sticky per session once a probe came back
    /// not-supported.
    fn probe_date_supported(&self) -> bool;
    fn probe_size_supported(&self) -> bool;
}
