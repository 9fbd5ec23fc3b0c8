#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tempfile::TempDir;

use lifesheet::now_ms;

pub async fn temp_pool() -> SqlitePool {
    lifesheet::logging::init();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    lifesheet::db::ensure_schema(&pool)
        .await
        .expect("apply schema");
    pool
}

/// File-backed pool with several connections, for tests that need real write
/// contention. The busy timeout is kept short so lock waits fail fast instead
/// of stalling the test. The `TempDir` must outlive the pool.
pub async fn contended_pool() -> (TempDir, SqlitePool) {
    lifesheet::logging::init();
    let dir = tempfile::tempdir().expect("create tempdir");
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("lifesheet.sqlite3"))
        .create_if_missing(true)
        .busy_timeout(Duration::from_millis(20))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("connect tempdir pool");
    lifesheet::db::ensure_schema(&pool)
        .await
        .expect("apply schema");
    (dir, pool)
}

pub async fn seed_user(pool: &SqlitePool, username: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO users (username, created_at) VALUES (?1, ?2) RETURNING id")
        .bind(username)
        .bind(now_ms())
        .fetch_one(pool)
        .await
        .expect("insert user")
}

pub async fn seed_asset(pool: &SqlitePool, user_id: i64, name: &str, value: f64) -> i64 {
    let now = now_ms();
    sqlx::query_scalar(
        "INSERT INTO assets (user_id, name, tag, current_value, custom_data, created_at, updated_at) \
         VALUES (?1, ?2, 'Investment', ?3, '{}', ?4, ?4) RETURNING id",
    )
    .bind(user_id)
    .bind(name)
    .bind(value)
    .bind(now)
    .fetch_one(pool)
    .await
    .expect("insert asset")
}

pub async fn seed_goal(pool: &SqlitePool, user_id: i64, name: &str, target: f64) -> i64 {
    let now = now_ms();
    sqlx::query_scalar(
        "INSERT INTO financial_goal (user_id, name, target_amount, custom_data, created_at, updated_at) \
         VALUES (?1, ?2, ?3, '{}', ?4, ?4) RETURNING id",
    )
    .bind(user_id)
    .bind(name)
    .bind(target)
    .bind(now)
    .fetch_one(pool)
    .await
    .expect("insert goal")
}

/// Overwrite a row's document directly, bypassing the ledger, the way the
/// uncoordinated legacy scripts used to. For corruption scenarios.
pub async fn put_asset_document(pool: &SqlitePool, asset_id: i64, doc: &str, updated_at: i64) {
    sqlx::query("UPDATE assets SET custom_data = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(doc)
        .bind(updated_at)
        .bind(asset_id)
        .execute(pool)
        .await
        .expect("overwrite asset document");
}

pub async fn put_goal_document(pool: &SqlitePool, goal_id: i64, doc: &str, updated_at: i64) {
    sqlx::query("UPDATE financial_goal SET custom_data = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(doc)
        .bind(updated_at)
        .bind(goal_id)
        .execute(pool)
        .await
        .expect("overwrite goal document");
}

pub async fn raw_asset_document(pool: &SqlitePool, asset_id: i64) -> serde_json::Value {
    let raw: String = sqlx::query_scalar("SELECT custom_data FROM assets WHERE id = ?1")
        .bind(asset_id)
        .fetch_one(pool)
        .await
        .expect("read asset document");
    serde_json::from_str(&raw).expect("valid document")
}

pub async fn raw_goal_document(pool: &SqlitePool, goal_id: i64) -> serde_json::Value {
    let raw: String = sqlx::query_scalar("SELECT custom_data FROM financial_goal WHERE id = ?1")
        .bind(goal_id)
        .fetch_one(pool)
        .await
        .expect("read goal document");
    serde_json::from_str(&raw).expect("valid document")
}
