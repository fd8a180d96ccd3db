//! Single writer thread.
//!
//! Every mutation of the store is a [`WriteCommand`] processed in order by one
//! thread that owns the write connection. Queued appends are drained into one
//! immediate transaction; a failed commit rolls the whole batch back and every
//! caller in it gets the error.

use crate::notifier::ChangeNotifier;
use crate::record::{RecordId, RequestRecord};
use crate::store::StoreError;
use crossbeam_channel::{Receiver, Sender};
use rusqlite::{params, Connection, TransactionBehavior};
use std::thread;
use tracing::{debug, error, trace, warn};

pub(crate) type Reply<T> = Sender<Result<T, StoreError>>;

/// Commands accepted by the writer thread.
pub(crate) enum WriteCommand {
    Append {
        record: RequestRecord,
        reply: Reply<RecordId>,
    },
    Delete {
        id: RecordId,
        reply: Reply<bool>,
    },
    DeleteAll {
        reply: Reply<usize>,
    },
    Flush {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Spawn the writer thread.
pub(crate) fn spawn_writer(
    conn: Connection,
    rx: Receiver<WriteCommand>,
    notifier: ChangeNotifier,
    max_batch: usize,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("store-writer".to_string())
        .spawn(move || {
            debug!("Store writer started");
            run_writer_loop(conn, rx, notifier, max_batch.max(1));
            debug!("Store writer stopped");
        })
}

fn run_writer_loop(
    mut conn: Connection,
    rx: Receiver<WriteCommand>,
    notifier: ChangeNotifier,
    max_batch: usize,
) {
    let mut pending: Option<WriteCommand> = None;

    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => {
                    debug!("Store writer channel closed");
                    break;
                }
            },
        };

        match cmd {
            WriteCommand::Append { record, reply } => {
                let mut batch = vec![(record, reply)];

                // Drain appends already queued; stop at the first other command
                while batch.len() < max_batch {
                    match rx.try_recv() {
                        Ok(WriteCommand::Append { record, reply }) => batch.push((record, reply)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_appends(&mut conn, batch, &notifier);
            }
            WriteCommand::Delete { id, reply } => {
                let result = delete_one(&mut conn, &id);
                if result.is_ok() {
                    notifier.publish();
                }
                let _ = reply.send(result);
            }
            WriteCommand::DeleteAll { reply } => {
                let result = delete_all(&mut conn);
                if result.is_ok() {
                    notifier.publish();
                }
                let _ = reply.send(result);
            }
            WriteCommand::Flush { reply } => {
                let result = conn
                    .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
                    .map_err(StoreError::from);
                let _ = reply.send(result);
            }
            WriteCommand::Shutdown => {
                debug!("Store writer received shutdown");
                break;
            }
        }
    }
}

fn commit_appends(
    conn: &mut Connection,
    batch: Vec<(RequestRecord, Reply<RecordId>)>,
    notifier: &ChangeNotifier,
) {
    let records: Vec<&RequestRecord> = batch.iter().map(|(record, _)| record).collect();

    match insert_batch(conn, &records) {
        Ok(()) => {
            trace!("Committed {} record(s)", batch.len());
            notifier.publish();
            for (record, reply) in batch {
                let _ = reply.send(Ok(record.id));
            }
        }
        Err(e) => {
            error!("Failed to commit {} record(s): {}", batch.len(), e);
            let message = e.to_string();
            for (_, reply) in batch {
                let _ = reply.send(Err(StoreError::CommitFailed(message.clone())));
            }
        }
    }
}

fn insert_batch(conn: &mut Connection, records: &[&RequestRecord]) -> rusqlite::Result<()> {
    // IMMEDIATE takes the file's write lock up front, so other processes queue
    // on busy_timeout instead of failing mid-transaction
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO requests (id, date, link, text) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for record in records {
            stmt.execute(params![
                record.id.to_string(),
                record.timestamp.timestamp_micros(),
                record.link,
                record.text,
            ])?;
        }
    }
    tx.commit()
}

fn delete_one(conn: &mut Connection, id: &RecordId) -> Result<bool, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let removed = tx.execute("DELETE FROM requests WHERE id = ?1", [id.to_string()])?;
    tx.commit()?;

    if removed > 1 {
        warn!("Delete of {} removed {} rows", id, removed);
    }
    Ok(removed > 0)
}

fn delete_all(conn: &mut Connection) -> Result<usize, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let removed = tx.execute("DELETE FROM requests", [])?;
    tx.commit()?;
    Ok(removed)
}
