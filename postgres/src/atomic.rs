//! Transaction blocks that nest by joining.

use crate::session::{PgSession, PgSessionError, PgSessionFactory, Transactional};
use lockstep_runtime::{RegistryError, ScopedRegistry};
use std::fmt::Display;

/// Run `body` inside a transaction on `session`.
///
/// If no transaction is open, one is begun, then committed when `body`
/// succeeds or rolled back when it fails. If a transaction is already open
/// (an outer `atomic` is running) `body` joins it and the outer block
/// decides the outcome.
///
/// When both `body` and the rollback fail, both are reported as one
/// [`PgSessionError::RollbackFailed`] carrying the body's error message: the
/// connection's transaction state is unknown at that point.
///
/// # Errors
///
/// Returns `body`'s error, a [`PgSessionError`] from `BEGIN`/`COMMIT`, or
/// [`PgSessionError::RollbackFailed`].
///
/// # Example
///
/// ```no_run
/// use lockstep_postgres::{PgSession, PgSessionError, atomic};
///
/// # async fn example(session: &PgSession) -> Result<(), PgSessionError> {
/// atomic(session, async |s: &PgSession| {
///     s.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
///     s.execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
///     Ok::<_, PgSessionError>(())
/// })
/// .await
/// # }
/// ```
pub async fn atomic<S, T, E>(session: &S, body: impl AsyncFnOnce(&S) -> Result<T, E>) -> Result<T, E>
where
    S: Transactional,
    E: From<PgSessionError> + Display,
{
    if session.in_transaction() {
        return body(session).await;
    }

    session.begin().await?;
    match body(session).await {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(error) => match session.rollback().await {
            Ok(()) => Err(error),
            Err(rollback_error) => {
                tracing::error!(error = %rollback_error, cause = %error, "Rollback failed after atomic block error");
                Err(PgSessionError::RollbackFailed {
                    error: rollback_error.to_string(),
                    cause: error.to_string(),
                }
                .into())
            }
        },
    }
}

/// [`atomic`] on the session of the current scope.
///
/// The session is taken from `sessions` (built on first use in the scope) so
/// every nested call inside the same scope shares one connection and one
/// transaction.
///
/// # Errors
///
/// Returns [`RegistryError::NoScope`] outside a scope, a construction error
/// from the registry, or any error [`atomic`] returns.
pub async fn atomic_scoped<T, E>(
    sessions: &ScopedRegistry<PgSessionFactory>,
    body: impl AsyncFnOnce(&PgSession) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<PgSessionError> + From<RegistryError> + Display,
{
    let session = sessions.get_current().await?;
    atomic(session.as_ref(), body).await
}
