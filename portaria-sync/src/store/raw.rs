//! SQL for single-collection operations.
//!
//! Every function runs on a plain connection so the same code serves pooled
//! one-shot calls and scoped transactions.

use super::schema::{index_expr, Collection};
use super::IndexValue;
use crate::error::{SyncError, SyncResult};
use serde_json::Value;
use sqlx::SqliteConnection;

/// Extract the primary key of a JSON document
pub(crate) fn document_key(collection: Collection, doc: &Value) -> SyncResult<String> {
    match doc.get(collection.key_field()) {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        Some(Value::Number(key)) => Ok(key.to_string()),
        _ => Err(SyncError::InvalidOperation(format!(
            "document in {} has no '{}' key",
            collection,
            collection.key_field()
        ))),
    }
}

fn ensure_index(collection: Collection, field: &str) -> SyncResult<()> {
    if collection.has_index(field) {
        Ok(())
    } else {
        Err(SyncError::InvalidOperation(format!(
            "collection {} has no index '{}'",
            collection, field
        )))
    }
}

fn parse_bodies(bodies: Vec<String>) -> SyncResult<Vec<Value>> {
    bodies
        .into_iter()
        .map(|body| serde_json::from_str(&body).map_err(SyncError::from))
        .collect()
}

pub(crate) async fn fetch(
    conn: &mut SqliteConnection,
    collection: Collection,
    key: &str,
) -> SyncResult<Option<Value>> {
    let sql = format!("SELECT body FROM {} WHERE pk = ?", collection.name());
    let body = sqlx::query_scalar::<_, String>(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    body.map(|b| serde_json::from_str(&b).map_err(SyncError::from))
        .transpose()
}

pub(crate) async fn fetch_all(
    conn: &mut SqliteConnection,
    collection: Collection,
) -> SyncResult<Vec<Value>> {
    let sql = format!("SELECT body FROM {} ORDER BY pk", collection.name());
    let bodies = sqlx::query_scalar::<_, String>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    parse_bodies(bodies)
}

pub(crate) async fn fetch_by_index(
    conn: &mut SqliteConnection,
    collection: Collection,
    field: &str,
    value: &IndexValue,
) -> SyncResult<Vec<Value>> {
    ensure_index(collection, field)?;
    let sql = format!(
        "SELECT body FROM {} WHERE {} = ? ORDER BY pk",
        collection.name(),
        index_expr(field)
    );
    let query = sqlx::query_scalar::<_, String>(&sql);
    let query = match value {
        IndexValue::Text(text) => query.bind(text.clone()),
        IndexValue::Integer(number) => query.bind(*number),
    };
    let bodies = query.fetch_all(&mut *conn).await?;
    parse_bodies(bodies)
}

pub(crate) async fn count(conn: &mut SqliteConnection, collection: Collection) -> SyncResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", collection.name());
    let count = sqlx::query_scalar::<_, i64>(&sql)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

pub(crate) async fn count_by_index(
    conn: &mut SqliteConnection,
    collection: Collection,
    field: &str,
    value: &IndexValue,
) -> SyncResult<u64> {
    ensure_index(collection, field)?;
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?",
        collection.name(),
        index_expr(field)
    );
    let query = sqlx::query_scalar::<_, i64>(&sql);
    let query = match value {
        IndexValue::Text(text) => query.bind(text.clone()),
        IndexValue::Integer(number) => query.bind(*number),
    };
    let count = query.fetch_one(&mut *conn).await?;
    Ok(count.max(0) as u64)
}

/// Insert or replace by primary key
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    collection: Collection,
    doc: &Value,
) -> SyncResult<String> {
    let key = document_key(collection, doc)?;
    let sql = format!(
        "INSERT INTO {} (pk, body) VALUES (?, ?) ON CONFLICT(pk) DO UPDATE SET body = excluded.body",
        collection.name()
    );
    sqlx::query(&sql)
        .bind(&key)
        .bind(doc.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(key)
}

/// Insert a new document; fails with `DuplicateKey` if the key exists
pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    collection: Collection,
    doc: &Value,
) -> SyncResult<String> {
    let key = document_key(collection, doc)?;
    let sql = format!(
        "INSERT INTO {} (pk, body) VALUES (?, ?) ON CONFLICT(pk) DO NOTHING",
        collection.name()
    );
    let result = sqlx::query(&sql)
        .bind(&key)
        .bind(doc.to_string())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::DuplicateKey {
            collection: collection.name().to_string(),
            key,
        });
    }
    Ok(key)
}

pub(crate) async fn delete(
    conn: &mut SqliteConnection,
    collection: Collection,
    key: &str,
) -> SyncResult<bool> {
    let sql = format!("DELETE FROM {} WHERE pk = ?", collection.name());
    let result = sqlx::query(&sql).bind(key).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn clear(conn: &mut SqliteConnection, collection: Collection) -> SyncResult<u64> {
    let sql = format!("DELETE FROM {}", collection.name());
    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_key_accepts_strings_and_numbers() {
        let student = json!({"matricula": "2024001", "nome": "Ana"});
        assert_eq!(document_key(Collection::Students, &student).unwrap(), "2024001");

        let key = json!({"versao": 3});
        assert_eq!(document_key(Collection::SigningKeys, &key).unwrap(), "3");
    }

    #[test]
    fn test_document_key_rejects_missing_or_empty() {
        assert!(document_key(Collection::Students, &json!({"nome": "Ana"})).is_err());
        assert!(document_key(Collection::Classes, &json!({"id": ""})).is_err());
    }

    #[test]
    fn test_unknown_index_is_rejected() {
        assert!(ensure_index(Collection::Students, "nome").is_err());
        assert!(ensure_index(Collection::Students, "turma_id").is_ok());
    }
}
