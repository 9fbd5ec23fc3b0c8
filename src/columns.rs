//! Per-user registry of custom asset columns, plus the typed value model
//! attribute values are checked against.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    sqlite::{SqliteArgumentValue, SqliteRow, SqliteTypeInfo, SqliteValueRef},
    Executor, Row, Sqlite, SqlitePool,
};

use crate::{time::now_ms, AppError, AppResult};

/// Baseline column set seeded for every user on first use of the asset view.
const DEFAULT_COLUMNS: &[(&str, &str, ColumnType, i64)] = &[
    ("notes", "Notes", ColumnType::Text, 0),
    ("owner", "Owner", ColumnType::Text, 1),
    ("units", "Units", ColumnType::Number, 2),
    ("subType", "Sub Type", ColumnType::Text, 3),
    ("currency", "Currency", ColumnType::Text, 4),
    ("costBasis", "Cost Basis", ColumnType::Currency, 5),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Currency,
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Currency => "currency",
            ColumnType::Date => "date",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<Sqlite> for ColumnType {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <&str as sqlx::Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, Sqlite> for ColumnType {
    fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> Result<IsNull, BoxDynError> {
        <&str as sqlx::Encode<'q, Sqlite>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Sqlite> for ColumnType {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<'r, Sqlite>>::decode(value)?;
        match raw {
            "text" => Ok(ColumnType::Text),
            "number" => Ok(ColumnType::Number),
            "currency" => Ok(ColumnType::Currency),
            "date" => Ok(ColumnType::Date),
            other => Err(format!("invalid column type: {other}").into()),
        }
    }
}

/// A typed value for a registered column. The tag replaces the original
/// system's read-time type inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ColumnValue {
    Text(String),
    Number(f64),
    Currency(f64),
    Date(NaiveDate),
}

impl ColumnValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValue::Text(_) => ColumnType::Text,
            ColumnValue::Number(_) => ColumnType::Number,
            ColumnValue::Currency(_) => ColumnType::Currency,
            ColumnValue::Date(_) => ColumnType::Date,
        }
    }

    pub fn matches(&self, column_type: ColumnType) -> bool {
        self.column_type() == column_type
    }

    /// Construct a value of the declared type from raw text.
    pub fn parse(column_type: ColumnType, raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        let type_error = || {
            AppError::new("SCHEMA/VALUE_TYPE", "Value does not match column type")
                .with_context("column_type", column_type.to_string())
                .with_context("value", raw.to_string())
        };
        match column_type {
            ColumnType::Text => Ok(ColumnValue::Text(raw.to_string())),
            ColumnType::Number => raw
                .parse::<f64>()
                .map(ColumnValue::Number)
                .map_err(|_| type_error()),
            ColumnType::Currency => raw
                .parse::<f64>()
                .map(ColumnValue::Currency)
                .map_err(|_| type_error()),
            ColumnType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(ColumnValue::Date)
                .map_err(|_| type_error()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDefinition {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub label: String,
    pub column_type: ColumnType,
    pub order: i64,
    pub created_at: i64,
}

impl TryFrom<&SqliteRow> for ColumnDefinition {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            user_id: row.try_get("user_id").map_err(AppError::from)?,
            key: row.try_get("column_key").map_err(AppError::from)?,
            label: row.try_get("column_label").map_err(AppError::from)?,
            column_type: row.try_get("column_type").map_err(AppError::from)?,
            order: row.try_get("column_order").map_err(AppError::from)?,
            created_at: row.try_get("created_at").map_err(AppError::from)?,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("2067")
            || db_err.message().starts_with("UNIQUE constraint failed");
    }
    false
}

const COLUMN_COLUMNS: &str =
    "id, user_id, column_key, column_label, column_type, column_order, created_at";

/// List a user's registered columns in display order, ties broken by
/// creation order.
///
/// Performs no seeding: a user that was never initialized gets an empty
/// list. Callers are expected to run [`ensure_defaults`] once per user
/// before reading, which is what puts the baseline set in place.
pub async fn list_columns<'e, E>(executor: E, user_id: i64) -> AppResult<Vec<ColumnDefinition>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {COLUMN_COLUMNS} FROM user_asset_columns \
         WHERE user_id = ?1 ORDER BY column_order, id"
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "columns_list")
                .with_context("user_id", user_id.to_string())
        })?;
    rows.iter().map(ColumnDefinition::try_from).collect()
}

/// Idempotently seed the baseline column set for a user.
///
/// Concurrency-safe through the `(user_id, column_key)` uniqueness: two
/// interleaved calls race on the inserts and the loser's rows are ignored.
pub async fn ensure_defaults(pool: &SqlitePool, user_id: i64) -> AppResult<()> {
    let now = now_ms();
    for (key, label, column_type, order) in DEFAULT_COLUMNS.iter().copied() {
        sqlx::query(
            "INSERT INTO user_asset_columns \
                 (user_id, column_key, column_label, column_type, column_order, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(user_id, column_key) DO NOTHING",
        )
        .bind(user_id)
        .bind(key)
        .bind(label)
        .bind(column_type)
        .bind(order)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "columns_ensure_defaults")
                .with_context("column_key", key.to_string())
                .with_context("user_id", user_id.to_string())
        })?;
    }
    tracing::debug!(
        target = "lifesheet",
        action = "ensure_default_columns",
        user_id = user_id
    );
    Ok(())
}

/// Register a new custom column, appended after the highest existing order.
pub async fn register_column(
    pool: &SqlitePool,
    user_id: i64,
    key: &str,
    label: &str,
    column_type: ColumnType,
) -> AppResult<ColumnDefinition> {
    let mut tx = pool.begin().await.map_err(|err| {
        AppError::from(err).with_context("operation", "columns_register_tx")
    })?;

    let next_order: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(column_order), -1) + 1 FROM user_asset_columns WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_one(tx.as_mut())
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "columns_register_order")
            .with_context("user_id", user_id.to_string())
    })?;

    let now = now_ms();
    let insert_result = sqlx::query(
        "INSERT INTO user_asset_columns \
             (user_id, column_key, column_label, column_type, column_order, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(user_id)
    .bind(key)
    .bind(label)
    .bind(column_type)
    .bind(next_order)
    .bind(now)
    .execute(tx.as_mut())
    .await;

    if let Err(err) = insert_result {
        if is_unique_violation(&err) {
            return Err(AppError::new(
                "SCHEMA/DUPLICATE_KEY",
                "A column with this key is already registered",
            )
            .with_context("column_key", key.to_string())
            .with_context("user_id", user_id.to_string()));
        }
        return Err(AppError::from(err)
            .with_context("operation", "columns_register")
            .with_context("column_key", key.to_string()));
    }

    let sql = format!(
        "SELECT {COLUMN_COLUMNS} FROM user_asset_columns \
         WHERE user_id = ?1 AND column_key = ?2"
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(key)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "columns_register_fetch")
                .with_context("column_key", key.to_string())
        })?;
    let definition = ColumnDefinition::try_from(&row)?;

    tx.commit().await.map_err(|err| {
        AppError::from(err).with_context("operation", "columns_register_commit")
    })?;

    tracing::debug!(
        target = "lifesheet",
        action = "register_column",
        user_id = user_id,
        column_key = %key,
        column_type = %column_type,
        column_order = definition.order
    );

    Ok(definition)
}
