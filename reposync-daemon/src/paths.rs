use std::path::{Path, PathBuf};

use reposync_core::registry::reposync_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    reposync_root(home).join(DAEMON_SOCKET)
}
