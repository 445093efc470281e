// sqlx::Error -> QueueError (orphan rules keep this out of core)

use workq_core::QueueError;

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> QueueError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // SQLite result codes: https://www.sqlite.org/rescode.html
            Some(code) => match code.as_ref() {
                "5" => QueueError::Backend(format!(
                    "level store locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                "13" => QueueError::Backend(format!("level store full: {}", db_err.message())),
                "11" => QueueError::Backend(format!(
                    "level store file is malformed: {}",
                    db_err.message()
                )),
                other => QueueError::Backend(format!(
                    "level store error [{}]: {}",
                    other,
                    db_err.message()
                )),
            },
            None => QueueError::Backend(format!("level store error: {}", db_err.message())),
        },
        sqlx::Error::PoolClosed => QueueError::Closed("level store".to_string()),
        sqlx::Error::Io(_) => QueueError::Backend(format!("level store I/O: {err}")),
        _ => QueueError::Backend(err.to_string()),
    }
}
