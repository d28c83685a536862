//! Embedded single-writer store.
//!
//! One dedicated worker thread owns the SQLite connection and consumes a
//! command queue; every caller, async or not, goes through [`Database::execute`]
//! and gets its result back over a oneshot channel. Writers are therefore
//! serialized by construction and the WAL keeps committed work durable
//! through an abrupt close.

mod migrations;
pub mod models;

pub mod aggregates;
pub mod apps;
pub mod domains;
pub mod samples;
pub mod settings;

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{error, info};

use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!(error = %err, "failed to send shutdown to store thread");
            }
            if let Err(join_err) = handle.join() {
                error!(?join_err, "failed to join store thread");
            }
        }
    }
}

/// Handle to the store. Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<Option<PathBuf>>,
}

impl Database {
    /// Opens (or creates) the store file, applies permissions and pragmas,
    /// and runs pending migrations before returning.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
            restrict_dir_permissions(parent)?;
        }

        let existed = db_path.exists();
        let db = Self::spawn_worker(Some(db_path.clone()))?;

        if !existed {
            restrict_file_permissions(&db_path)?;
        }

        info!(path = %db_path.display(), "store opened");

        Ok(db)
    }

    /// Opens a private in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn_worker(None)
    }

    fn spawn_worker(db_path: Option<PathBuf>) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("netmond-store".into())
            .spawn(move || {
                let open_result = match &path_for_thread {
                    Some(path) => Connection::open(path),
                    None => Connection::open_in_memory(),
                };

                let mut conn = match open_result {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx
                            .send(Err(anyhow::Error::new(err).context("opening SQLite store")));
                        return;
                    }
                };

                let init_result = configure(&conn)
                    .and_then(|()| run_migrations(&mut conn).context("running store migrations"));
                if ready_tx.send(init_result).is_err() {
                    error!("store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                info!("store thread shutting down");
            })
            .context("spawning store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Runs `task` on the store thread and awaits its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow::anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("store thread terminated unexpectedly"))?
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("enabling WAL mode")?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .context("applying store pragmas")?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("setting permissions on {}", dir.display()))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("setting permissions on {}", file.display()))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_file: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_roundtrip() {
        let db = Database::open_in_memory().expect("open");
        let answer = db
            .execute(|conn| {
                conn.query_row("SELECT 40 + 2", [], |row| row.get::<_, i64>(0))
                    .map_err(Into::into)
            })
            .await
            .expect("query");
        assert_eq!(answer, 42);
    }

    #[tokio::test]
    async fn test_open_creates_restricted_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("netmond.db");
        let db = Database::open(path.clone()).expect("open");

        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(file_mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(path.parent().expect("parent"))
                .expect("meta")
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let db = Database::open_in_memory().expect("open");
        let result = db
            .execute(|conn| {
                conn.execute(
                    "INSERT INTO raw_samples (ts, app_id, bytes_out, bytes_in) VALUES (1, 999, 0, 0)",
                    [],
                )
                .map_err(Into::into)
            })
            .await;
        assert!(result.is_err(), "dangling app_id must be rejected");
    }
}
