//! Scoped `PostgreSQL` sessions for Lockstep.
//!
//! This crate plugs `sqlx` connections into the scoped registry from
//! `lockstep-runtime`:
//!
//! - [`PgSessionFactory`]: a resource factory opening one connection per scope
//!   and closing it when the scope is cleared
//! - [`PgSession`]: the shared connection, with transaction state
//! - [`atomic`] / [`atomic_scoped`]: transaction blocks where inner blocks
//!   join the outer transaction
//!
//! # Example
//!
//! ```no_run
//! use lockstep_postgres::{PgSession, PgSessionError, PgSessionFactory, atomic_scoped};
//! use lockstep_runtime::{RegistryError, ScopeCloser, ScopeKey, ScopedRegistry, run_in_scope};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! enum AppError {
//!     Db(PgSessionError),
//!     Registry(RegistryError),
//! }
//! # impl From<PgSessionError> for AppError { fn from(e: PgSessionError) -> Self { Self::Db(e) } }
//! # impl From<RegistryError> for AppError { fn from(e: RegistryError) -> Self { Self::Registry(e) } }
//! # impl std::fmt::Display for AppError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{self:?}") }
//! # }
//!
//! # async fn example() -> Result<(), AppError> {
//! let sessions = Arc::new(ScopedRegistry::new("postgres", PgSessionFactory::from_env()?));
//! let closer = ScopeCloser::new().with(sessions.clone());
//!
//! run_in_scope(ScopeKey::new(), &closer, async {
//!     atomic_scoped(&sessions, async |session: &PgSession| {
//!         session.execute("DELETE FROM expired_tokens").await?;
//!         Ok::<_, AppError>(())
//!     })
//!     .await
//! })
//! .await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod atomic;
pub mod session;

pub use atomic::{atomic, atomic_scoped};
pub use session::{PgSession, PgSessionError, PgSessionFactory, Transactional};
