//! Scoped SQL parameter sets, macro-resolving query specs, and connection and
//! transaction lifecycle over SQLite.
//!
//! ```rust
//! use sql_composer::prelude::*;
//!
//! # fn main() -> Result<(), ComposerError> {
//! let mut conn = ConnectionManager::new(ConnectionSettings::new(":memory:"));
//! // An in-memory database lives only while its handle is open.
//! conn.open()?;
//! conn.execute_non_query(&QuerySpec::new("CREATE TABLE t (id INTEGER, name TEXT)"))?;
//!
//! let mut params = ParameterSet::new();
//! params.add("@id", 1)?;
//! params.add("@name", "alice")?;
//! let insert = QuerySpec::new("INSERT INTO t VALUES (@id, @name)").with_params(params);
//! assert_eq!(conn.execute_non_query(&insert)?, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod marker;
pub mod paging;
pub mod parameter;
pub mod parameter_set;
pub mod prelude;
pub mod query_spec;
pub mod registry;
pub mod results;
pub mod substitution;
pub mod types;

pub use error::ComposerError;
