// Cover art: the per-player image file and the pool of covers that arrived
// before their player did.
//
// Each player's cover lives at `<dir>/libwnp-cover-<id>.png`, where `<dir>`
// defaults to the platform temp directory. The path is exposed to users as a
// `file://` URI in `Player::cover`. Since ids are slot indices, a new player
// in a reused slot overwrites the previous occupant's file.
//
// The browser may send a cover (binary frame) before the PLAYER_ADDED text
// message for the same tab. Such covers are parked in `CoverBuffers`, keyed
// by connection and port id, and claimed when the player shows up. The pool
// is bounded; a cover that does not fit is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use wnp_server::ConnectionId;

use crate::player::{MAX_PLAYERS, PlayerId};

#[derive(Clone, Debug)]
pub struct CoverStore {
    dir: PathBuf,
}

impl Default for CoverStore {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl CoverStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: PlayerId) -> PathBuf {
        self.dir.join(format!("libwnp-cover-{}.png", id.0))
    }

    /// `file://` URI of the cover path, with forward slashes.
    pub fn uri(&self, id: PlayerId) -> String {
        let path = self.path(id).to_string_lossy().replace('\\', "/");
        if path.starts_with('/') {
            format!("file://{path}")
        } else {
            format!("file:///{path}")
        }
    }

    /// Write the image for `id` and return its URI.
    pub fn write(&self, id: PlayerId, image: &[u8]) -> io::Result<String> {
        fs::write(self.path(id), image)?;
        Ok(self.uri(id))
    }
}

struct Buffered {
    conn: ConnectionId,
    port_id: i64,
    image: Vec<u8>,
}

/// Covers waiting for their player.
pub struct CoverBuffers {
    capacity: usize,
    pending: Mutex<Vec<Buffered>>,
}

impl Default for CoverBuffers {
    fn default() -> Self {
        Self::with_capacity(MAX_PLAYERS)
    }
}

impl CoverBuffers {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Buffered>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a cover. Returns false, dropping it, when the pool is full.
    pub fn push(&self, conn: ConnectionId, port_id: i64, image: Vec<u8>) -> bool {
        let mut pending = self.lock();
        if pending.len() >= self.capacity {
            debug!(%conn, port_id, "cover buffer pool full; dropping cover");
            return false;
        }
        pending.push(Buffered {
            conn,
            port_id,
            image,
        });
        true
    }

    /// Claim the oldest cover parked for `(conn, port_id)`.
    pub fn take(&self, conn: ConnectionId, port_id: i64) -> Option<Vec<u8>> {
        let mut pending = self.lock();
        let index = pending
            .iter()
            .position(|b| b.conn == conn && b.port_id == port_id)?;
        Some(pending.remove(index).image)
    }

    /// Drop everything parked for `conn`.
    pub fn purge(&self, conn: ConnectionId) {
        self.lock().retain(|b| b.conn != conn);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_uri_follow_player_id() {
        let store = CoverStore::new("/var/covers");
        assert_eq!(
            store.path(PlayerId(3)),
            Path::new("/var/covers/libwnp-cover-3.png")
        );
        #[cfg(unix)]
        assert_eq!(store.uri(PlayerId(3)), "file:///var/covers/libwnp-cover-3.png");
    }

    #[test]
    fn write_creates_file_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CoverStore::new(dir.path());
        let uri = store.write(PlayerId(0), b"first").unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("libwnp-cover-0.png"));
        store.write(PlayerId(0), b"second").unwrap();
        assert_eq!(fs::read(store.path(PlayerId(0))).unwrap(), b"second");
    }

    #[test]
    fn write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CoverStore::new(dir.path().join("nope"));
        assert!(store.write(PlayerId(1), b"x").is_err());
    }

    #[test]
    fn buffers_match_connection_and_port() {
        let buffers = CoverBuffers::default();
        let (a, b) = (ConnectionId(1), ConnectionId(2));
        assert!(buffers.push(a, 5, b"a5".to_vec()));
        assert!(buffers.push(b, 5, b"b5".to_vec()));
        assert_eq!(buffers.take(a, 6), None);
        assert_eq!(buffers.take(b, 5), Some(b"b5".to_vec()));
        assert_eq!(buffers.take(b, 5), None);
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn pool_is_bounded() {
        let buffers = CoverBuffers::with_capacity(2);
        let conn = ConnectionId(1);
        assert!(buffers.push(conn, 1, vec![1]));
        assert!(buffers.push(conn, 2, vec![2]));
        assert!(!buffers.push(conn, 3, vec![3]));
        assert_eq!(buffers.take(conn, 3), None);
    }

    #[test]
    fn purge_drops_only_that_connection() {
        let buffers = CoverBuffers::default();
        buffers.push(ConnectionId(1), 1, vec![1]);
        buffers.push(ConnectionId(1), 2, vec![2]);
        buffers.push(ConnectionId(2), 1, vec![3]);
        buffers.purge(ConnectionId(1));
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers.take(ConnectionId(2), 1), Some(vec![3]));
        assert!(buffers.is_empty());
    }
}
