//! The user table: one face image per unique user name.

use crate::table_name::TableName;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DATABASE_EXTENSION: &str = ".sqlite3";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user {0:?} already exists, enter a new user name")]
    DuplicateUser(String),
    #[error("database error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),
}

/// One stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_name: String,
    /// Encoded image bytes, normally JPEG.
    pub user_image: Vec<u8>,
}

impl UserRecord {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_name: self.user_name.clone(),
            image_bytes: self.user_image.len(),
        }
    }
}

/// Printable view of a [`UserRecord`] without the image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user_name: String,
    pub image_bytes: usize,
}

/// Anything that can list every stored user.
pub trait UserRecords {
    fn all_users(&self) -> Result<Vec<UserRecord>, StoreError>;
}

/// SQLite-backed user table. Each call auto-commits.
pub struct UserDatabase {
    database_path: Option<PathBuf>,
    table: TableName,
    conn: Connection,
}

impl UserDatabase {
    /// Open (or create) the database file. The table itself is created by
    /// [`create_user_table`](Self::create_user_table).
    pub fn open(database_path: impl AsRef<Path>, table: TableName) -> Result<Self, StoreError> {
        let database_path = database_path.as_ref().to_path_buf();
        let conn = Connection::open(&database_path).map_err(backend("open"))?;
        tracing::info!(path = %database_path.display(), table = %table, "opened user database");
        Ok(Self {
            database_path: Some(database_path),
            table,
            conn,
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(table: TableName) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend("open"))?;
        Ok(Self {
            database_path: None,
            table,
            conn,
        })
    }

    /// File backing this database; `None` when in memory.
    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    pub fn table_name(&self) -> &TableName {
        &self.table
    }

    /// Switch to another database file, re-opening the connection.
    ///
    /// `.sqlite3` is appended when the name does not already contain it.
    pub fn set_database_name(&mut self, name: &str) -> Result<(), StoreError> {
        let name = if name.contains(DATABASE_EXTENSION) {
            name.to_string()
        } else {
            format!("{name}{DATABASE_EXTENSION}")
        };
        let path = PathBuf::from(name);
        self.conn = Connection::open(&path).map_err(backend("open"))?;
        tracing::info!(path = %path.display(), "switched user database");
        self.database_path = Some(path);
        Ok(())
    }

    /// Use another table for all following operations.
    pub fn set_table_name(&mut self, name: &str) -> Result<(), StoreError> {
        self.table = name.parse()?;
        tracing::info!(table = %self.table, "switched user table");
        Ok(())
    }

    /// Create the user table if it does not exist yet.
    pub fn create_user_table(&self) -> Result<(), StoreError> {
        self.conn
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (user_name TEXT PRIMARY KEY, user_image BLOB)",
                    self.table
                ),
                [],
            )
            .map_err(backend("create table"))?;
        Ok(())
    }

    /// Store the contents of an image file for `user_name`.
    pub fn insert_user_image_file(
        &self,
        user_name: &str,
        image_path: impl AsRef<Path>,
    ) -> Result<(), StoreError> {
        let image_path = image_path.as_ref();
        let bytes = std::fs::read(image_path).map_err(|source| {
            tracing::error!(path = %image_path.display(), error = %source, "failed to read image");
            StoreError::Io {
                path: image_path.to_path_buf(),
                source,
            }
        })?;
        self.insert_user_image(user_name, &bytes)
    }

    /// Store already-encoded image bytes for `user_name`.
    pub fn insert_user_image(&self, user_name: &str, image: &[u8]) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (user_name, user_image) VALUES (?1, ?2)",
            self.table
        );
        match self.conn.execute(&sql, params![user_name, image]) {
            Ok(_) => {
                tracing::info!(user = user_name, bytes = image.len(), "stored user image");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                tracing::error!(user = user_name, "user already exists");
                Err(StoreError::DuplicateUser(user_name.to_string()))
            }
            Err(e) => Err(backend("insert")(e)),
        }
    }

    /// Every stored user, in insertion order.
    pub fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT user_name, user_image FROM {} ORDER BY rowid",
                self.table
            ))
            .map_err(backend("select"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    user_name: row.get(0)?,
                    user_image: row.get(1)?,
                })
            })
            .map_err(backend("select"))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend("select"))
    }

    /// The user stored under exactly `user_name`, if any.
    pub fn get_user(&self, user_name: &str) -> Result<Option<UserRecord>, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT user_name, user_image FROM {} WHERE user_name = ?1",
                    self.table
                ),
                params![user_name],
                |row| {
                    Ok(UserRecord {
                        user_name: row.get(0)?,
                        user_image: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend("select"))
    }

    pub fn user_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))
            .map_err(backend("count"))?;
        Ok(count as usize)
    }

    /// Delete a user. Returns `false` when no such user was stored.
    pub fn delete_user(&self, user_name: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE user_name = ?1", self.table),
                params![user_name],
            )
            .map_err(backend("delete"))?;
        if deleted == 0 {
            tracing::warn!(user = user_name, "no such user to delete");
            return Ok(false);
        }
        tracing::info!(user = user_name, "deleted user");
        Ok(true)
    }

    /// Drop the whole table. Fails if it does not exist.
    pub fn drop_table(&self) -> Result<(), StoreError> {
        self.conn
            .execute(&format!("DROP TABLE {}", self.table), [])
            .map_err(backend("drop table"))?;
        tracing::info!(table = %self.table, "table dropped");
        Ok(())
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| backend("close")(e))
    }
}

impl UserRecords for UserDatabase {
    fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        UserDatabase::all_users(self)
    }
}

/// Log a backend failure for `op` and wrap it.
fn backend(op: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| {
        tracing::error!(op, error = %e, "database operation failed");
        StoreError::Backend(e)
    }
}
