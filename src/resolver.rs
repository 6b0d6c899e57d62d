//! Mapping an accepted connection to the process that opened it.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Resolves the process owning the remote end of an accepted connection.
///
/// `local` is the knocked port's address, `remote` the peer address returned
/// by `accept`. Returns `None` when the owner cannot be determined.
pub trait OwnerResolver: Send + Sync {
    /// Look up the owner of `remote`.
    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Option<u32>;
}

impl<F> OwnerResolver for F
where
    F: Fn(SocketAddr, SocketAddr) -> Option<u32> + Send + Sync,
{
    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Option<u32> {
        self(local, remote)
    }
}

/// Resolver for same-host clients backed by `/proc`.
///
/// Finds the socket whose local port is the accepted peer's port and whose
/// remote port is the knocked port in `/proc/net/tcp{,6}`, then the process
/// holding `socket:[inode]` among `/proc/<pid>/fd`.
pub struct ProcNetResolver {
    root: PathBuf,
}

impl ProcNetResolver {
    /// Resolver reading the system `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Resolver reading a procfs mounted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn socket_inode(&self, local_port: u16, remote_port: u16) -> Option<u64> {
        ["net/tcp", "net/tcp6"].iter().find_map(|table| {
            let contents = fs::read_to_string(self.root.join(table)).ok()?;
            find_inode(&contents, local_port, remote_port)
        })
    }

    fn inode_owner(&self, inode: u64) -> io::Result<Option<u32>> {
        let needle = format!("socket:[{inode}]");
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if holds_link(&entry.path().join("fd"), &needle) {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }
}

impl Default for ProcNetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerResolver for ProcNetResolver {
    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Option<u32> {
        let inode = self.socket_inode(remote.port(), local.port())?;
        self.inode_owner(inode).ok().flatten()
    }
}

fn holds_link(fd_dir: &Path, needle: &str) -> bool {
    let Ok(fds) = fs::read_dir(fd_dir) else {
        return false;
    };
    fds.filter_map(Result::ok)
        .filter_map(|fd| fs::read_link(fd.path()).ok())
        .any(|target| target.as_os_str() == needle)
}

/// Port part of a `/proc/net/tcp` address such as `0100007F:5384`.
fn hex_port(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

/// Inode of the first socket in a `/proc/net/tcp` table with the given ports.
fn find_inode(table: &str, local_port: u16, remote_port: u16) -> Option<u64> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        if hex_port(fields[1])? != local_port || hex_port(fields[2])? != remote_port {
            return None;
        }
        fields[9].parse::<u64>().ok().filter(|&inode| inode != 0)
    })
}
