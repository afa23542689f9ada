//! SQLite-backed [`StoreAdapter`], grounded in the teacher's
//! `repository::connect` (WAL pragmas for concurrent readers/writer) and
//! `repository::document::schema` (explicit typed columns plus JSON-blob
//! columns for opaque data).
//!
//! Two collections get first-class, indexed schemas — annotation items and
//! annotators, the only two record shapes `spec.md` §6 documents. Any other
//! `(index, doc_type)` pair (e.g. a seeder's source document corpus) falls
//! back to a generic `(id, body)` table queried via SQLite's `json_extract`.
//! This is narrower than a general-purpose document store; see `DESIGN.md`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::{json, Value};

use super::{Page, Query, Result, Sort, SortOrder, StoreAdapter, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

/// Which physical table a given `(index, doc_type)` pair resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableKind {
    AnnotationItems,
    Annotators,
    Generic,
}

fn table_kind(doc_type: &str) -> TableKind {
    match doc_type {
        "annotator" | "annotators" => TableKind::Annotators,
        "annotation" | "annotations" => TableKind::AnnotationItems,
        _ => TableKind::Generic,
    }
}

/// Sanitize an arbitrary `(index, doc_type)` pair into a SQLite identifier
/// for the generic fallback table. Only `[a-zA-Z0-9_]` survive; everything
/// else becomes `_`.
fn generic_table_name(index: &str, doc_type: &str) -> String {
    let raw = format!("generic_{index}_{doc_type}");
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn sqlite_err_to_store_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                StoreError::Transient(e.to_string())
            }
            rusqlite::ErrorCode::ConstraintViolation => StoreError::Conflict(e.to_string()),
            _ => StoreError::Fatal(e.to_string()),
        },
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
        _ => StoreError::Fatal(e.to_string()),
    }
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(sqlite_err_to_store_err)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 30000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(sqlite_err_to_store_err)?;
        Ok(conn)
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.connect()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Fatal(format!("blocking task panicked: {e}")))?
    }
}

fn create_annotation_items_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS annotation_items (
            id TEXT PRIMARY KEY,
            task_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            doc TEXT NOT NULL,
            context TEXT,
            num_valid_annotations INTEGER NOT NULL DEFAULT 0,
            annotations TEXT NOT NULL DEFAULT '[]',
            invalid TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_annotation_items_unannotated
            ON annotation_items(task_name, doc_id)
            WHERE annotations = '[]' AND invalid IS NULL;

        CREATE INDEX IF NOT EXISTS idx_annotation_items_partial
            ON annotation_items(task_name, num_valid_annotations)
            WHERE invalid IS NULL;
        "#,
    )
    .map_err(sqlite_err_to_store_err)
}

fn create_annotators_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS annotators (
            id TEXT PRIMARY KEY,
            email TEXT,
            signup TEXT NOT NULL,
            last_login TEXT
        );
        "#,
    )
    .map_err(sqlite_err_to_store_err)
}

fn create_generic_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );
        "#
    ))
    .map_err(sqlite_err_to_store_err)
}

/// Row -> full JSON record, in the shape `spec.md` §6 documents.
fn annotation_item_row_to_value(
    task_name: String,
    created_at: String,
    doc_id: String,
    doc: String,
    context: Option<String>,
    num_valid_annotations: i64,
    annotations: String,
    invalid: Option<String>,
) -> Result<Value> {
    let doc: Value = serde_json::from_str(&doc).map_err(|e| StoreError::Fatal(e.to_string()))?;
    let context: Option<Value> = context
        .map(|c| serde_json::from_str(&c))
        .transpose()
        .map_err(|e| StoreError::Fatal(e.to_string()))?;
    let annotations: Value =
        serde_json::from_str(&annotations).map_err(|e| StoreError::Fatal(e.to_string()))?;
    let invalid: Option<Value> = invalid
        .map(|i| serde_json::from_str(&i))
        .transpose()
        .map_err(|e| StoreError::Fatal(e.to_string()))?;

    let mut obj = json!({
        "name": task_name,
        "created": created_at,
        "docId": doc_id,
        "doc": doc,
        "numValidAnnotations": num_valid_annotations,
        "annotations": annotations,
    });
    let map = obj.as_object_mut().unwrap();
    if let Some(context) = context {
        map.insert("context".into(), context);
    }
    if let Some(invalid) = invalid {
        map.insert("invalid".into(), invalid);
    }
    Ok(obj)
}

/// Decompose a full annotation-item JSON record into column values for
/// writing. Missing fields default the way a freshly-seeded record would.
fn annotation_item_columns(body: &Value) -> Result<(String, String, String, String, Option<String>, i64, String, Option<String>)> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Fatal("annotation record missing 'name'".into()))?
        .to_string();
    let created = body
        .get("created")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let doc_id = body
        .get("docId")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Fatal("annotation record missing 'docId'".into()))?
        .to_string();
    let doc = serde_json::to_string(body.get("doc").unwrap_or(&Value::Null))
        .map_err(|e| StoreError::Fatal(e.to_string()))?;
    let context = body
        .get("context")
        .filter(|v| !v.is_null())
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Fatal(e.to_string()))?;
    let num_valid_annotations = body
        .get("numValidAnnotations")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let annotations = serde_json::to_string(
        body.get("annotations").unwrap_or(&Value::Array(vec![])),
    )
    .map_err(|e| StoreError::Fatal(e.to_string()))?;
    let invalid = body
        .get("invalid")
        .filter(|v| !v.is_null())
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Fatal(e.to_string()))?;

    Ok((
        name,
        created,
        doc_id,
        doc,
        context,
        num_valid_annotations,
        annotations,
        invalid,
    ))
}

/// Translate a [`Query`] against `annotation_items` into a `WHERE` fragment.
fn annotation_items_where(query: &Query) -> (String, Vec<Box<dyn ToSql>>) {
    match query {
        Query::All => ("1=1".to_string(), vec![]),
        Query::Term { field, value } => match field.as_str() {
            "name" => ("task_name = ?".to_string(), vec![Box::new(value.clone())]),
            "docId" => ("doc_id = ?".to_string(), vec![Box::new(value.clone())]),
            _ => ("1=1".to_string(), vec![]),
        },
        Query::Range { field, lt, gt } if field == "numValidAnnotations" => {
            let mut clauses = vec![];
            let mut p: Vec<Box<dyn ToSql>> = vec![];
            if let Some(lt) = lt {
                clauses.push("num_valid_annotations < ?".to_string());
                p.push(Box::new(*lt));
            }
            if let Some(gt) = gt {
                clauses.push("num_valid_annotations > ?".to_string());
                p.push(Box::new(*gt));
            }
            if clauses.is_empty() {
                ("1=1".to_string(), vec![])
            } else {
                (clauses.join(" AND "), p)
            }
        }
        Query::Range { .. } => ("1=1".to_string(), vec![]),
        Query::Exists { field } => match field.as_str() {
            "annotations" => ("annotations != '[]'".to_string(), vec![]),
            "invalid" => ("invalid IS NOT NULL".to_string(), vec![]),
            _ => ("1=1".to_string(), vec![]),
        },
        Query::Bool { filter, must_not } => {
            let mut clauses = vec![];
            let mut params: Vec<Box<dyn ToSql>> = vec![];
            for q in filter {
                let (c, p) = annotation_items_where(q);
                clauses.push(format!("({c})"));
                params.extend(p);
            }
            for q in must_not {
                let (c, p) = annotation_items_where(q);
                clauses.push(format!("NOT ({c})"));
                params.extend(p);
            }
            if clauses.is_empty() {
                ("1=1".to_string(), vec![])
            } else {
                (clauses.join(" AND "), params)
            }
        }
    }
}

fn generic_where(query: &Query) -> (String, Vec<Box<dyn ToSql>>) {
    match query {
        Query::All => ("1=1".to_string(), vec![]),
        Query::Term { field, value } => (
            format!("json_extract(body, '$.{field}') = ?"),
            vec![Box::new(value.clone())],
        ),
        Query::Range { field, lt, gt } => {
            let mut clauses = vec![];
            let mut p: Vec<Box<dyn ToSql>> = vec![];
            if let Some(lt) = lt {
                clauses.push(format!("json_extract(body, '$.{field}') < ?"));
                p.push(Box::new(*lt));
            }
            if let Some(gt) = gt {
                clauses.push(format!("json_extract(body, '$.{field}') > ?"));
                p.push(Box::new(*gt));
            }
            if clauses.is_empty() {
                ("1=1".to_string(), vec![])
            } else {
                (clauses.join(" AND "), p)
            }
        }
        Query::Exists { field } => (
            format!("json_extract(body, '$.{field}') IS NOT NULL"),
            vec![],
        ),
        Query::Bool { filter, must_not } => {
            let mut clauses = vec![];
            let mut params: Vec<Box<dyn ToSql>> = vec![];
            for q in filter {
                let (c, p) = generic_where(q);
                clauses.push(format!("({c})"));
                params.extend(p);
            }
            for q in must_not {
                let (c, p) = generic_where(q);
                clauses.push(format!("NOT ({c})"));
                params.extend(p);
            }
            if clauses.is_empty() {
                ("1=1".to_string(), vec![])
            } else {
                (clauses.join(" AND "), params)
            }
        }
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn ensure_schema(&self, index: &str, doc_type: &str) -> Result<()> {
        let kind = table_kind(doc_type);
        let index = index.to_string();
        let doc_type = doc_type.to_string();
        self.run_blocking(move |conn| match kind {
            TableKind::AnnotationItems => create_annotation_items_table(conn),
            TableKind::Annotators => create_annotators_table(conn),
            TableKind::Generic => {
                create_generic_table(conn, &generic_table_name(&index, &doc_type))
            }
        })
        .await
    }

    async fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<Value> {
        let kind = table_kind(doc_type);
        let table = generic_table_name(index, doc_type);
        let id = id.to_string();
        self.run_blocking(move |conn| match kind {
            TableKind::AnnotationItems => conn
                .query_row(
                    "SELECT task_name, created_at, doc_id, doc, context, num_valid_annotations, annotations, invalid
                     FROM annotation_items WHERE id = ?",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    },
                )
                .optional()
                .map_err(sqlite_err_to_store_err)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))
                .and_then(|(n, c, d, doc, ctx, nva, ann, inv)| {
                    annotation_item_row_to_value(n, c, d, doc, ctx, nva, ann, inv)
                }),
            TableKind::Annotators => conn
                .query_row(
                    "SELECT email, signup, last_login FROM annotators WHERE id = ?",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(sqlite_err_to_store_err)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))
                .map(|(email, signup, last_login)| {
                    let mut obj = json!({ "signup": signup });
                    let map = obj.as_object_mut().unwrap();
                    if let Some(email) = email {
                        map.insert("email".into(), json!(email));
                    }
                    if let Some(last_login) = last_login {
                        map.insert("lastLogin".into(), json!(last_login));
                    }
                    obj
                }),
            TableKind::Generic => conn
                .query_row(
                    &format!("SELECT body FROM {table} WHERE id = ?"),
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(sqlite_err_to_store_err)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))
                .and_then(|body| {
                    serde_json::from_str(&body).map_err(|e| StoreError::Fatal(e.to_string()))
                }),
        })
        .await
    }

    async fn put(&self, index: &str, doc_type: &str, id: &str, body: Value) -> Result<()> {
        let kind = table_kind(doc_type);
        let table = generic_table_name(index, doc_type);
        let id = id.to_string();
        self.run_blocking(move |conn| match kind {
            TableKind::AnnotationItems => {
                let (name, created, doc_id, doc, context, nva, annotations, invalid) =
                    annotation_item_columns(&body)?;
                conn.execute(
                    "INSERT INTO annotation_items
                        (id, task_name, created_at, doc_id, doc, context, num_valid_annotations, annotations, invalid)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        task_name = excluded.task_name,
                        created_at = excluded.created_at,
                        doc_id = excluded.doc_id,
                        doc = excluded.doc,
                        context = excluded.context,
                        num_valid_annotations = excluded.num_valid_annotations,
                        annotations = excluded.annotations,
                        invalid = excluded.invalid",
                    params![id, name, created, doc_id, doc, context, nva, annotations, invalid],
                )
                .map_err(sqlite_err_to_store_err)?;
                Ok(())
            }
            TableKind::Annotators => {
                let email = body.get("email").and_then(Value::as_str);
                let signup = body
                    .get("signup")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| Utc::now().to_rfc3339());
                let last_login = body.get("lastLogin").and_then(Value::as_str);
                conn.execute(
                    "INSERT INTO annotators (id, email, signup, last_login) VALUES (?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        email = excluded.email, signup = excluded.signup, last_login = excluded.last_login",
                    params![id, email, signup, last_login],
                )
                .map_err(sqlite_err_to_store_err)?;
                Ok(())
            }
            TableKind::Generic => {
                let body_str =
                    serde_json::to_string(&body).map_err(|e| StoreError::Fatal(e.to_string()))?;
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (id, body) VALUES (?, ?)
                         ON CONFLICT(id) DO UPDATE SET body = excluded.body"
                    ),
                    params![id, body_str],
                )
                .map_err(sqlite_err_to_store_err)?;
                Ok(())
            }
        })
        .await
    }

    async fn update(&self, index: &str, doc_type: &str, id: &str, patch: Value) -> Result<()> {
        let existing = self.get(index, doc_type, id).await?;
        let mut merged = existing;
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        self.put(index, doc_type, id, merged).await
    }

    async fn search(
        &self,
        index: &str,
        doc_type: &str,
        query: &Query,
        from: usize,
        size: usize,
        sort: Option<&Sort>,
    ) -> Result<Page> {
        let kind = table_kind(doc_type);
        let table = generic_table_name(index, doc_type);
        let query = query.clone();
        let sort = sort.cloned();
        self.run_blocking(move |conn| match kind {
            TableKind::AnnotationItems => {
                let (where_sql, params) = annotation_items_where(&query);
                let order_sql = match &sort {
                    Some(Sort { field, order }) if field == "docId" => {
                        let dir = match order {
                            SortOrder::Asc => "ASC",
                            SortOrder::Desc => "DESC",
                        };
                        format!("ORDER BY doc_id {dir}")
                    }
                    _ => "ORDER BY id ASC".to_string(),
                };
                let sql = format!(
                    "SELECT id, task_name, created_at, doc_id, doc, context, num_valid_annotations, annotations, invalid
                     FROM annotation_items WHERE {where_sql} {order_sql} LIMIT ? OFFSET ?"
                );
                let mut stmt = conn.prepare(&sql).map_err(sqlite_err_to_store_err)?;
                let mut all_params: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let size_i64 = size as i64;
                let from_i64 = from as i64;
                all_params.push(&size_i64);
                all_params.push(&from_i64);
                let rows = stmt
                    .query_map(all_params.as_slice(), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, Option<String>>(8)?,
                        ))
                    })
                    .map_err(sqlite_err_to_store_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(sqlite_err_to_store_err)?;

                let mut hits = vec![];
                for (id, n, c, d, doc, ctx, nva, ann, inv) in rows {
                    hits.push((id, annotation_item_row_to_value(n, c, d, doc, ctx, nva, ann, inv)?));
                }
                Ok(Page { hits })
            }
            TableKind::Annotators => Ok(Page { hits: vec![] }),
            TableKind::Generic => {
                let (where_sql, params) = generic_where(&query);
                let sql = format!(
                    "SELECT id, body FROM {table} WHERE {where_sql} ORDER BY id ASC LIMIT ? OFFSET ?"
                );
                let mut stmt = conn.prepare(&sql).map_err(sqlite_err_to_store_err)?;
                let mut all_params: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let size_i64 = size as i64;
                let from_i64 = from as i64;
                all_params.push(&size_i64);
                all_params.push(&from_i64);
                let rows = stmt
                    .query_map(all_params.as_slice(), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(sqlite_err_to_store_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(sqlite_err_to_store_err)?;
                let mut hits = vec![];
                for (id, body) in rows {
                    let v: Value =
                        serde_json::from_str(&body).map_err(|e| StoreError::Fatal(e.to_string()))?;
                    hits.push((id, v));
                }
                Ok(Page { hits })
            }
        })
        .await
    }

    async fn scan(&self, index: &str, doc_type: &str, query: &Query) -> Result<Vec<(String, Value)>> {
        // No natural page limit for a scan: walk it window by window until a
        // page comes back short. This mirrors Elasticsearch's scroll-to-exhaustion
        // behavior closely enough for the one caller (`fill_partial`) that
        // always drains the whole thing.
        const WINDOW: usize = 500;
        let mut from = 0;
        let mut all = vec![];
        loop {
            let page = self.search(index, doc_type, query, from, WINDOW, None).await?;
            let got = page.hits.len();
            all.extend(page.hits);
            if got < WINDOW {
                break;
            }
            from += got;
        }
        Ok(all)
    }

    async fn bulk_index(
        &self,
        index: &str,
        doc_type: &str,
        records: Vec<(String, Value)>,
    ) -> Result<()> {
        let kind = table_kind(doc_type);
        let table = generic_table_name(index, doc_type);
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction().map_err(sqlite_err_to_store_err)?;
            for (id, body) in records {
                match kind {
                    TableKind::AnnotationItems => {
                        let (name, created, doc_id, doc, context, nva, annotations, invalid) =
                            annotation_item_columns(&body)?;
                        tx.execute(
                            "INSERT INTO annotation_items
                                (id, task_name, created_at, doc_id, doc, context, num_valid_annotations, annotations, invalid)
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                             ON CONFLICT(id) DO UPDATE SET
                                task_name = excluded.task_name, created_at = excluded.created_at,
                                doc_id = excluded.doc_id, doc = excluded.doc, context = excluded.context,
                                num_valid_annotations = excluded.num_valid_annotations,
                                annotations = excluded.annotations, invalid = excluded.invalid",
                            params![id, name, created, doc_id, doc, context, nva, annotations, invalid],
                        )
                        .map_err(sqlite_err_to_store_err)?;
                    }
                    TableKind::Annotators => {
                        let email = body.get("email").and_then(Value::as_str);
                        let signup = body
                            .get("signup")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| Utc::now().to_rfc3339());
                        let last_login = body.get("lastLogin").and_then(Value::as_str);
                        tx.execute(
                            "INSERT INTO annotators (id, email, signup, last_login) VALUES (?, ?, ?, ?)
                             ON CONFLICT(id) DO UPDATE SET email = excluded.email, signup = excluded.signup, last_login = excluded.last_login",
                            params![id, email, signup, last_login],
                        )
                        .map_err(sqlite_err_to_store_err)?;
                    }
                    TableKind::Generic => {
                        let body_str = serde_json::to_string(&body)
                            .map_err(|e| StoreError::Fatal(e.to_string()))?;
                        tx.execute(
                            &format!(
                                "INSERT INTO {table} (id, body) VALUES (?, ?)
                                 ON CONFLICT(id) DO UPDATE SET body = excluded.body"
                            ),
                            params![id, body_str],
                        )
                        .map_err(sqlite_err_to_store_err)?;
                    }
                }
            }
            tx.commit().map_err(sqlite_err_to_store_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SqliteStore {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        // Keep the file alive for the duration of the test by leaking the path.
        let path = path.keep().unwrap();
        SqliteStore::new(path)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_annotation_item() {
        let store = temp_store();
        store.ensure_schema("annotations", "annotation").await.unwrap();

        let record = json!({
            "name": "task-a",
            "created": "2026-01-01T00:00:00Z",
            "docId": "doc-1",
            "doc": { "text": "hello" },
            "numValidAnnotations": 0,
            "annotations": [],
        });
        store
            .put("annotations", "annotation", "item-1", record)
            .await
            .unwrap();

        let got = store.get("annotations", "annotation", "item-1").await.unwrap();
        assert_eq!(got["docId"], json!("doc-1"));
        assert_eq!(got["doc"]["text"], json!("hello"));
        assert_eq!(got["numValidAnnotations"], json!(0));
    }

    #[tokio::test]
    async fn update_merges_top_level_fields_only() {
        let store = temp_store();
        store.ensure_schema("annotations", "annotation").await.unwrap();
        store
            .put(
                "annotations",
                "annotation",
                "item-1",
                json!({
                    "name": "task-a",
                    "docId": "doc-1",
                    "doc": { "text": "hello" },
                    "numValidAnnotations": 0,
                    "annotations": [],
                }),
            )
            .await
            .unwrap();

        store
            .update(
                "annotations",
                "annotation",
                "item-1",
                json!({ "numValidAnnotations": 1 }),
            )
            .await
            .unwrap();

        let got = store.get("annotations", "annotation", "item-1").await.unwrap();
        assert_eq!(got["numValidAnnotations"], json!(1));
        assert_eq!(got["doc"]["text"], json!("hello"));
    }

    #[tokio::test]
    async fn search_filters_unannotated_items_by_task_name() {
        let store = temp_store();
        store.ensure_schema("annotations", "annotation").await.unwrap();

        for i in 0..3 {
            store
                .put(
                    "annotations",
                    "annotation",
                    &format!("item-{i}"),
                    json!({
                        "name": "task-a",
                        "docId": format!("doc-{i}"),
                        "doc": {},
                        "numValidAnnotations": 0,
                        "annotations": [],
                    }),
                )
                .await
                .unwrap();
        }
        store
            .put(
                "annotations",
                "annotation",
                "item-other-task",
                json!({
                    "name": "task-b",
                    "docId": "doc-x",
                    "doc": {},
                    "numValidAnnotations": 0,
                    "annotations": [],
                }),
            )
            .await
            .unwrap();

        let query = Query::and(vec![Query::term("name", "task-a")])
            .and_not(vec![Query::exists("annotations"), Query::exists("invalid")]);
        let page = store
            .search("annotations", "annotation", &query, 0, 10, None)
            .await
            .unwrap();
        assert_eq!(page.hits.len(), 3);
    }

    #[tokio::test]
    async fn scan_drains_every_matching_record_across_windows() {
        let store = temp_store();
        store.ensure_schema("annotations", "annotation").await.unwrap();
        for i in 0..5 {
            store
                .put(
                    "annotations",
                    "annotation",
                    &format!("item-{i}"),
                    json!({
                        "name": "task-a",
                        "docId": format!("doc-{i}"),
                        "doc": {},
                        "numValidAnnotations": 1,
                        "annotations": [{"annotatorId": "a", "annotation": "yes", "time": "now"}],
                    }),
                )
                .await
                .unwrap();
        }
        let query = Query::and(vec![
            Query::term("name", "task-a"),
            Query::range_lt_gt("numValidAnnotations", 2, -1),
            Query::exists("annotations"),
        ])
        .and_not(vec![Query::exists("invalid")]);
        let all = store.scan("annotations", "annotation", &query).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn ensure_annotator_creates_once_and_is_idempotent() {
        let store = temp_store();
        store.ensure_schema("annotations", "annotator").await.unwrap();

        store
            .ensure_annotator("annotations", "annotator", "ann-1")
            .await
            .unwrap();
        let first = store.get("annotations", "annotator", "ann-1").await.unwrap();
        assert!(first.get("signup").is_some());

        // A second call for the same id must not overwrite the record.
        store
            .ensure_annotator("annotations", "annotator", "ann-1")
            .await
            .unwrap();
        let second = store.get("annotations", "annotator", "ann-1").await.unwrap();
        assert_eq!(first["signup"], second["signup"]);
    }
}
