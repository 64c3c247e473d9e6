pub mod relay;

pub use relay::*;

use std::path::PathBuf;

/// Returns the global config directory path: `~/.config/hookrelay/`
pub fn dirs_global() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("hookrelay")
}

/// Runtime directory for the socket.
/// Prefers XDG_RUNTIME_DIR (typically /run/user/<uid>/, mode 0700).
/// Falls back to /tmp if not set.
pub fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Socket path used when neither the config file nor `HOOKRELAY_SOCKET` names one.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("hookrelay.sock")
}
