//! File markers signalling knock completion between a client and the server.
//!
//! The client creates `knock_<pid>` before knocking; the server deletes it when
//! the knock is confirmed; the client polls until the file is gone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::key::Port;

/// Marker file name prefix.
pub const MARKER_PREFIX: &str = "knock_";

/// Path of the marker for process `pid`.
pub fn marker_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{MARKER_PREFIX}{pid}"))
}

/// Create the marker for `pid`, recording the ports it is about to knock.
pub fn create(dir: &Path, pid: u32, ports: &[Port]) -> io::Result<PathBuf> {
    let path = marker_path(dir, pid);
    fs::write(&path, format!("{pid}\n{ports:?}\n"))?;
    Ok(path)
}

/// Delete the marker for `pid`.
pub fn remove(dir: &Path, pid: u32) -> io::Result<PathBuf> {
    let path = marker_path(dir, pid);
    fs::remove_file(&path)?;
    Ok(path)
}

/// Poll `path` every `poll` until it disappears or `timeout` elapses.
///
/// Returns true if the file was removed in time.
pub fn wait_removed(path: &Path, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !path.exists() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll.min(deadline - now));
    }
}
