//! Remote-Postgres output: the mapping template must render a JSON object
//! (or array of objects); each object becomes one inserted row. Inserts are
//! not retried, since idempotency is not guaranteed on the remote side.

use super::{OutputError, render_template};
use crate::message::Message;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, QueryBuilder};

#[allow(clippy::too_many_arguments)]
pub(super) async fn run(
    message: &Message,
    result: &serde_json::Value,
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    database: &str,
    table: &str,
    mapping: &str,
) -> Result<(), OutputError> {
    let rendered = render_template(mapping, message, result)?;
    let rows = decode_rows(&rendered)?;
    if rows.is_empty() {
        return Ok(());
    }

    let url = format!("postgres://{user}:{password}@{host}:{port}/{database}");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .map_err(|e| OutputError::Database {
            reason: e.to_string(),
        })?;

    for row in rows {
        insert_row(&pool, table, &row).await?;
    }
    pool.close().await;
    Ok(())
}

async fn insert_row(
    pool: &sqlx::PgPool,
    table: &str,
    row: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), OutputError> {
    if row.is_empty() {
        return Err(OutputError::BadResult {
            reason: "mapping rendered an empty row".to_string(),
        });
    }

    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} (", quote_ident(table)?));
    let mut separated = builder.separated(", ");
    for column in row.keys() {
        separated.push(quote_ident(column)?);
    }
    builder.push(") VALUES (");
    let mut separated = builder.separated(", ");
    for value in row.values() {
        match value {
            serde_json::Value::Null => {
                separated.push_bind(Option::<String>::None);
            }
            serde_json::Value::Bool(b) => {
                separated.push_bind(*b);
            }
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    separated.push_bind(i);
                } else {
                    separated.push_bind(n.as_f64().unwrap_or(f64::NAN));
                }
            }
            serde_json::Value::String(s) => {
                separated.push_bind(s.clone());
            }
            nested => {
                separated.push_bind(sqlx::types::Json(nested.clone()));
            }
        }
    }
    builder.push(")");

    builder
        .build()
        .execute(pool)
        .await
        .map_err(|e| OutputError::Database {
            reason: e.to_string(),
        })?;
    Ok(())
}

fn decode_rows(
    rendered: &str,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, OutputError> {
    let value: serde_json::Value =
        serde_json::from_str(rendered).map_err(|e| OutputError::Template {
            reason: format!("mapping must render JSON: {e}"),
        })?;
    match value {
        serde_json::Value::Object(row) => Ok(vec![row]),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(row) => Ok(row),
                other => Err(OutputError::BadResult {
                    reason: format!("row is not an object: {other}"),
                }),
            })
            .collect(),
        other => Err(OutputError::BadResult {
            reason: format!("mapping rendered {other}, expected object or array"),
        }),
    }
}

fn quote_ident(ident: &str) -> Result<String, OutputError> {
    if ident.is_empty() || ident.contains('"') || ident.contains('\0') {
        return Err(OutputError::BadResult {
            reason: format!("unusable identifier {ident:?}"),
        });
    }
    Ok(format!("\"{ident}\""))
}
