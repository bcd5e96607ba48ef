use std::sync::Arc;

use tracing::error;

use parley_db::{Database, DbResult};

use crate::error::{Error, Result};

/// Run a store call on the blocking pool so SQLite never stalls the runtime.
pub(crate) async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            Error::Persistence("store task failed".into())
        })?
        .map_err(Error::from)
}
