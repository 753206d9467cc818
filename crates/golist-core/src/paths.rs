//! Well-known locations shared by the daemon and its clients.
//!
//! Both live in the OS temporary directory so every client on the machine
//! finds the same daemon without configuration.

use std::path::PathBuf;

/// File name of the daemon's unix socket
pub const SOCKET_FILE_NAME: &str = "golistsocket";

/// File name of the cache database
pub const DB_FILE_NAME: &str = "golist.db";

/// Default path of the daemon socket (`<tmpdir>/golistsocket`)
pub fn socket_path() -> PathBuf {
    std::env::temp_dir().join(SOCKET_FILE_NAME)
}

/// Default path of the cache database (`<tmpdir>/golist.db`)
pub fn db_path() -> PathBuf {
    std::env::temp_dir().join(DB_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_in_temp_dir() {
        let tmp = std::env::temp_dir();
        assert_eq!(socket_path(), tmp.join("golistsocket"));
        assert_eq!(db_path(), tmp.join("golist.db"));
    }
}
