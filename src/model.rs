use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use crate::{linkdoc, AppError, AppResult};

/// An asset row. Created and destroyed by collaborators outside this core;
/// the core only ever rewrites `custom_data` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub current_value: f64,
    pub custom_data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A financial goal row, the other side of every earmark link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialGoal {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub target_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_age: Option<i64>,
    pub custom_data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

fn document_column(row: &SqliteRow) -> AppResult<Value> {
    let raw: Option<String> = row
        .try_get("custom_data")
        .map_err(AppError::from)?;
    linkdoc::parse_document(raw.as_deref())
}

fn asset_from_row(row: &SqliteRow, custom_data: Value) -> AppResult<Asset> {
    Ok(Asset {
        id: row.try_get("id").map_err(AppError::from)?,
        user_id: row.try_get("user_id").map_err(AppError::from)?,
        profile_id: row
            .try_get::<Option<i64>, _>("profile_id")
            .map_err(AppError::from)?,
        name: row.try_get("name").map_err(AppError::from)?,
        tag: row
            .try_get::<Option<String>, _>("tag")
            .map_err(AppError::from)?,
        current_value: row.try_get("current_value").map_err(AppError::from)?,
        custom_data,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        updated_at: row.try_get("updated_at").map_err(AppError::from)?,
    })
}

fn goal_from_row(row: &SqliteRow, custom_data: Value) -> AppResult<FinancialGoal> {
    Ok(FinancialGoal {
        id: row.try_get("id").map_err(AppError::from)?,
        user_id: row.try_get("user_id").map_err(AppError::from)?,
        name: row.try_get("name").map_err(AppError::from)?,
        target_amount: row.try_get("target_amount").map_err(AppError::from)?,
        target_date: row
            .try_get::<Option<String>, _>("target_date")
            .map_err(AppError::from)?,
        target_age: row
            .try_get::<Option<i64>, _>("target_age")
            .map_err(AppError::from)?,
        custom_data,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        updated_at: row.try_get("updated_at").map_err(AppError::from)?,
    })
}

impl TryFrom<&SqliteRow> for Asset {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        asset_from_row(row, document_column(row)?)
    }
}

impl TryFrom<&SqliteRow> for FinancialGoal {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        goal_from_row(row, document_column(row)?)
    }
}

// Legacy scripts wrote `custom_data` without validation, so a repair scan has
// to survive blobs that no longer parse. Degrades those to an empty document
// and reports the row id so the caller can rewrite it.
fn document_column_lenient(row: &SqliteRow, table: &str) -> AppResult<(Value, bool)> {
    match document_column(row) {
        Ok(doc) => Ok((doc, false)),
        Err(err) if err.code().starts_with("JSON/") => {
            let id: i64 = row.try_get("id").map_err(AppError::from)?;
            tracing::warn!(
                target = "lifesheet",
                action = "malformed_document",
                table = table,
                id = id,
                error = %err
            );
            Ok((Value::Object(serde_json::Map::new()), true))
        }
        Err(err) => Err(err),
    }
}

const ASSET_COLUMNS: &str = "id, user_id, profile_id, name, tag, current_value, \
                             custom_data, created_at, updated_at";
const GOAL_COLUMNS: &str = "id, user_id, name, target_amount, target_date, target_age, \
                            custom_data, created_at, updated_at";

pub async fn get_asset<'e, E>(executor: E, asset_id: i64) -> AppResult<Option<Asset>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(asset_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(Asset::try_from).transpose()
}

pub async fn get_goal<'e, E>(executor: E, goal_id: i64) -> AppResult<Option<FinancialGoal>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {GOAL_COLUMNS} FROM financial_goal WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(goal_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(FinancialGoal::try_from).transpose()
}

pub async fn list_assets<'e, E>(executor: E, user_id: i64) -> AppResult<Vec<Asset>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE user_id = ?1 ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(Asset::try_from).collect()
}

pub async fn list_goals<'e, E>(executor: E, user_id: i64) -> AppResult<Vec<FinancialGoal>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {GOAL_COLUMNS} FROM financial_goal WHERE user_id = ?1 ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(FinancialGoal::try_from).collect()
}

/// Variant of [`list_assets`] for repair passes: a malformed `custom_data`
/// blob is degraded to an empty document instead of failing the scan. Returns
/// the assets together with the ids of rows whose document had to be reset.
pub async fn list_assets_lenient<'e, E>(
    executor: E,
    user_id: i64,
) -> AppResult<(Vec<Asset>, Vec<i64>)>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE user_id = ?1 ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::from)?;
    let mut assets = Vec::with_capacity(rows.len());
    let mut malformed = Vec::new();
    for row in &rows {
        let (doc, reset) = document_column_lenient(row, "assets")?;
        let asset = asset_from_row(row, doc)?;
        if reset {
            malformed.push(asset.id);
        }
        assets.push(asset);
    }
    Ok((assets, malformed))
}

/// Goal-side counterpart of [`list_assets_lenient`].
pub async fn list_goals_lenient<'e, E>(
    executor: E,
    user_id: i64,
) -> AppResult<(Vec<FinancialGoal>, Vec<i64>)>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {GOAL_COLUMNS} FROM financial_goal WHERE user_id = ?1 ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::from)?;
    let mut goals = Vec::with_capacity(rows.len());
    let mut malformed = Vec::new();
    for row in &rows {
        let (doc, reset) = document_column_lenient(row, "financial_goal")?;
        let goal = goal_from_row(row, doc)?;
        if reset {
            malformed.push(goal.id);
        }
        goals.push(goal);
    }
    Ok((goals, malformed))
}

/// Current values of all of a user's assets, keyed by asset id. Input shape
/// for the funding calculator.
pub async fn asset_values<'e, E>(executor: E, user_id: i64) -> AppResult<HashMap<i64, f64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64, f64)> =
        sqlx::query_as("SELECT id, current_value FROM assets WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::from)?;
    Ok(rows.into_iter().collect())
}
