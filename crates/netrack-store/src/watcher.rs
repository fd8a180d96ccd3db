//! Cross-process change detection.
//!
//! SQLite bumps `PRAGMA data_version` on a connection whenever another
//! connection commits to the same file. The watcher polls it and republishes
//! each bump on the local [`ChangeNotifier`].

use crate::notifier::ChangeNotifier;
use crate::store::StoreError;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rusqlite::Connection;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Background poller that turns foreign commits into change signals.
///
/// Stops when dropped.
pub struct ChangeWatcher {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    pub(crate) fn spawn(
        conn: Connection,
        interval: Duration,
        notifier: ChangeNotifier,
    ) -> Result<Self, StoreError> {
        let mut last = data_version(&conn)?;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("store-watcher".to_string())
            .spawn(move || {
                debug!("Store watcher started ({:?} interval)", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    match data_version(&conn) {
                        Ok(version) if version != last => {
                            trace!("Store data_version {} -> {}", last, version);
                            last = version;
                            notifier.publish();
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Store watcher poll failed: {}", e),
                    }
                }
                debug!("Store watcher stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the thread
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Store watcher panicked");
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn data_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA data_version", [], |row| row.get(0))
}
