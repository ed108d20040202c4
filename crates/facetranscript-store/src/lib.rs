//! facetranscript-store: SQLite persistence of user names and face images.
//!
//! One table, one row per user: `user_name TEXT PRIMARY KEY, user_image BLOB`.

pub mod table_name;
pub mod user_database;

pub use table_name::TableName;
pub use user_database::{StoreError, UserDatabase, UserRecord, UserRecords, UserSummary};
