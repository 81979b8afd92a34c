//! Byte-range record locks over the mapped state files.
//!
//! All cross-worker coordination (entry assignment, scan-reset, counter
//! pairs) is serialised through one-byte fcntl lock regions at named
//! offsets. On Linux the open-file-description variants are used so that
//! two handles conflict even when they live in the same process; the
//! classic per-process variants would silently grant both.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

#[cfg(target_os = "linux")]
const SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SETLKW: libc::c_int = libc::F_OFD_SETLKW;
#[cfg(not(target_os = "linux"))]
const SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SETLKW: libc::c_int = libc::F_SETLKW;

fn flock_at(kind: libc::c_short, offset: u64) -> libc::flock {
    // zeroed because the libc struct carries platform-private padding fields
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;
    fl.l_pid = 0;
    fl
}

/// Take a one-byte write lock at `offset`, blocking until granted.
pub fn lock_region(file: &File, offset: u64) -> io::Result<()> {
    let mut fl = flock_at(libc::F_WRLCK as libc::c_short, offset);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), SETLKW, &mut fl) };
    if rc == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Try to take a one-byte write lock at `offset` without blocking.
/// Returns `false` when another handle already holds the region.
pub fn try_lock_region(file: &File, offset: u64) -> io::Result<bool> {
    let mut fl = flock_at(libc::F_WRLCK as libc::c_short, offset);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), SETLK, &mut fl) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

/// Region lock held for the lifetime of the guard; released on every exit
/// path, including unwinds out of guarded counter updates.
///
/// The guard owns a duplicated descriptor onto the same open file
/// description, so holding it does not borrow the handle it came from.
pub struct RegionGuard {
    file: File,
    offset: u64,
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        let _ = unlock_region(&self.file, self.offset);
    }
}

/// Take a one-byte write lock at `offset` and return a guard for it,
/// blocking until granted.
pub fn lock_guard(file: &File, offset: u64) -> io::Result<RegionGuard> {
    let dup = file.try_clone()?;
    lock_region(&dup, offset)?;
    Ok(RegionGuard { file: dup, offset })
}

/// Non-blocking variant of [`lock_guard`]; `None` when the region is taken.
pub fn try_lock_guard(file: &File, offset: u64) -> io::Result<Option<RegionGuard>> {
    let dup = file.try_clone()?;
    if try_lock_region(&dup, offset)? {
        Ok(Some(RegionGuard { file: dup, offset }))
    } else {
        Ok(None)
    }
}

/// Release a one-byte lock previously taken at `offset`.
pub fn unlock_region(file: &File, offset: u64) -> io::Result<()> {
    let mut fl = flock_at(libc::F_UNLCK as libc::c_short, offset);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), SETLK, &mut fl) };
    if rc == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
