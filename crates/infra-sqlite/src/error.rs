// sqlx::Error -> AppError mapping
// (orphan rules prevent implementing From<sqlx::Error> for AppError here)

use tessera_core::error::AppError;

/// Convert sqlx::Error to AppError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // SQLite result codes: https://www.sqlite.org/rescode.html
            Some(code) => match code.as_ref() {
                "2067" | "1555" => AppError::Database(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code
                )),
                "5" => AppError::Database(format!("Database locked (SQLITE_BUSY): {}", db_err.message())),
                "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                "14" => AppError::Database(format!("Unable to open database file: {}", db_err.message())),
                other => AppError::Database(format!("Database error [{}]: {}", other, db_err.message())),
            },
            None => AppError::Database(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => AppError::Database(format!("Column not found: {}", col)),
        sqlx::Error::ColumnDecode { index, source } => {
            AppError::Database(format!("Failed to decode column {}: {}", index, source))
        }
        // Connection, pool, protocol errors
        _ => AppError::Database(err.to_string()),
    }
}
