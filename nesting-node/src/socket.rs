//! Location of the control socket.

use std::path::PathBuf;

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "NESTING_SOCKET";

/// File name of the socket inside the runtime directory.
pub const SOCKET_FILE: &str = "nesting.sock";

/// The socket path used when `NESTING_SOCKET` is not set.
///
/// - macOS: `~/Library/Application Support/nesting.sock`
/// - Windows: `%LOCALAPPDATA%\nesting.sock`
/// - others: `$XDG_RUNTIME_DIR/nesting.sock`
///
/// Falls back to the home directory, then the current directory.
pub fn default_socket_path() -> PathBuf {
    runtime_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SOCKET_FILE)
}

/// `NESTING_SOCKET` if set and non-empty, else [`default_socket_path`].
pub fn socket_path() -> PathBuf {
    match std::env::var_os(SOCKET_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_socket_path(),
    }
}

#[cfg(target_os = "macos")]
fn runtime_dir() -> Option<PathBuf> {
    dirs::data_dir()
}

#[cfg(windows)]
fn runtime_dir() -> Option<PathBuf> {
    dirs::data_local_dir()
}

#[cfg(not(any(target_os = "macos", windows)))]
fn runtime_dir() -> Option<PathBuf> {
    dirs::runtime_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_file_name() {
        let path = default_socket_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(SOCKET_FILE));
    }
}
