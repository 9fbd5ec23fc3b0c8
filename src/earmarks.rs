//! The earmark ledger: sole writer of the link structures on both the asset
//! and the goal side, owner of the mirror invariant between them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::{
    linkdoc::{self, AssetLink, GoalEarmark},
    model::{self, Asset, FinancialGoal},
    time::now_ms,
    AppError, AppResult,
};

const MAX_TX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 25;

/// Percent sums are compared with a small tolerance so that repeated
/// float arithmetic cannot reject an exact 100% allocation.
const SUM_EPSILON: f64 = 1e-9;

/// Optional display-name overrides for [`set_link`]. When a name is absent
/// the authoritative row name is cached instead.
#[derive(Debug, Clone, Default)]
pub struct LinkNames {
    pub asset_name: Option<String>,
    pub goal_name: Option<String>,
}

/// Repairs applied by a [`reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Mirror entries created on the side that was missing one.
    pub missing_mirrors: u64,
    /// Entries dropped because the referenced asset or goal no longer exists.
    pub dangling_references: u64,
    /// Pairs whose percents disagreed; resolved toward the newer side.
    pub percent_conflicts: u64,
    /// Documents that no longer parsed as JSON and were rebuilt from scratch.
    pub documents_reset: u64,
    /// Rows rewritten by the pass.
    pub rows_rewritten: u64,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == ReconcileReport::default()
    }
}

fn is_busy(err: &AppError) -> bool {
    // SQLITE_BUSY is primary code 5, SQLITE_LOCKED is 6; extended codes
    // (261 BUSY_RECOVERY, 517 BUSY_SNAPSHOT, ...) keep the primary code in
    // the low byte.
    if let Some(code) = err.code().strip_prefix("Sqlite/") {
        if let Ok(code) = code.parse::<i64>() {
            let primary = code & 0xff;
            if primary == 5 || primary == 6 {
                return true;
            }
        }
    }
    err.message().contains("database is locked")
        || err.message().contains("database table is locked")
}

async fn with_write_retries<T, F, Fut>(operation: &'static str, mut attempt_fn: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt + 1 < MAX_TX_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(
                    target = "lifesheet",
                    action = "write_retry",
                    operation = operation,
                    attempt = attempt
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * u64::from(attempt)))
                    .await;
            }
            Err(err) if is_busy(&err) => {
                return Err(AppError::new(
                    "EARMARK/CONFLICT",
                    "Concurrent writes kept the link documents locked",
                )
                .with_context("operation", operation)
                .with_context("attempts", MAX_TX_ATTEMPTS.to_string())
                .with_cause(err));
            }
            Err(err) => return Err(err),
        }
    }
}

fn validate_percent(percent: f64) -> AppResult<()> {
    if !(0.0..=100.0).contains(&percent) || percent.is_nan() {
        return Err(AppError::new(
            "EARMARK/INVALID_PERCENT",
            "Earmark percent must be between 0 and 100",
        )
        .with_context("percent", percent.to_string()));
    }
    Ok(())
}

fn earmark_sum(earmarks: &[GoalEarmark]) -> f64 {
    earmarks.iter().map(|e| e.percent).sum()
}

fn link_sum(links: &[AssetLink]) -> f64 {
    links.iter().map(|l| l.percent).sum()
}

async fn load_asset_tx(tx: &mut Transaction<'_, Sqlite>, asset_id: i64) -> AppResult<Asset> {
    model::get_asset(tx.as_mut(), asset_id)
        .await?
        .ok_or_else(|| {
            AppError::new("EARMARK/ENTITY_NOT_FOUND", "Asset not found")
                .with_context("asset_id", asset_id.to_string())
        })
}

async fn load_goal_tx(tx: &mut Transaction<'_, Sqlite>, goal_id: i64) -> AppResult<FinancialGoal> {
    model::get_goal(tx.as_mut(), goal_id)
        .await?
        .ok_or_else(|| {
            AppError::new("EARMARK/ENTITY_NOT_FOUND", "Goal not found")
                .with_context("goal_id", goal_id.to_string())
        })
}

async fn write_asset_document(
    tx: &mut Transaction<'_, Sqlite>,
    asset_id: i64,
    doc: &serde_json::Value,
) -> AppResult<()> {
    sqlx::query("UPDATE assets SET custom_data = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(linkdoc::document_to_string(doc)?)
        .bind(now_ms())
        .bind(asset_id)
        .execute(tx.as_mut())
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "earmark_write_asset")
                .with_context("asset_id", asset_id.to_string())
        })?;
    Ok(())
}

async fn write_goal_document(
    tx: &mut Transaction<'_, Sqlite>,
    goal_id: i64,
    doc: &serde_json::Value,
) -> AppResult<()> {
    sqlx::query("UPDATE financial_goal SET custom_data = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(linkdoc::document_to_string(doc)?)
        .bind(now_ms())
        .bind(goal_id)
        .execute(tx.as_mut())
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "earmark_write_goal")
                .with_context("goal_id", goal_id.to_string())
        })?;
    Ok(())
}

async fn set_link_tx(
    pool: &SqlitePool,
    asset_id: i64,
    goal_id: i64,
    percent: f64,
    names: &LinkNames,
) -> AppResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_set_tx"))?;

    let mut asset = load_asset_tx(&mut tx, asset_id).await?;
    let mut goal = load_goal_tx(&mut tx, goal_id).await?;

    let goal_label = names.goal_name.clone().unwrap_or_else(|| goal.name.clone());
    let asset_label = names
        .asset_name
        .clone()
        .unwrap_or_else(|| asset.name.clone());

    // Asset side: replace the existing entry for this goal or append.
    let mut earmarks = linkdoc::decode_asset_links(&asset.custom_data);
    match earmarks.iter_mut().find(|e| e.goal_id == goal_id) {
        Some(entry) => {
            entry.percent = percent;
            entry.goal_name = goal_label.clone();
        }
        None => earmarks.push(GoalEarmark {
            goal_id,
            goal_name: goal_label.clone(),
            percent,
        }),
    }
    let asset_sum = earmark_sum(&earmarks);
    if asset_sum > 100.0 + SUM_EPSILON {
        return Err(AppError::new(
            "EARMARK/OVER_ALLOCATED",
            "Asset earmarks would exceed 100%",
        )
        .with_context("asset_id", asset_id.to_string())
        .with_context("total_percent", format!("{asset_sum}")));
    }

    // Goal side, symmetric.
    let mut links = linkdoc::decode_goal_links(&goal.custom_data);
    match links.iter_mut().find(|l| l.asset_id == asset_id) {
        Some(entry) => {
            entry.percent = percent;
            entry.asset_name = asset_label.clone();
        }
        None => links.push(AssetLink {
            asset_id,
            asset_name: asset_label.clone(),
            percent,
        }),
    }
    let goal_sum = link_sum(&links);
    if goal_sum > 100.0 + SUM_EPSILON {
        return Err(AppError::new(
            "EARMARK/OVER_ALLOCATED",
            "Goal linked assets would exceed 100%",
        )
        .with_context("goal_id", goal_id.to_string())
        .with_context("total_percent", format!("{goal_sum}")));
    }

    linkdoc::encode_asset_links(&mut asset.custom_data, &earmarks);
    linkdoc::encode_goal_links(&mut goal.custom_data, &links);

    write_asset_document(&mut tx, asset_id, &asset.custom_data).await?;
    write_goal_document(&mut tx, goal_id, &goal.custom_data).await?;

    tx.commit()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_set_commit"))?;

    tracing::debug!(
        target = "lifesheet",
        action = "set_link",
        asset_id = asset_id,
        goal_id = goal_id,
        percent = percent
    );

    Ok(())
}

/// Create or update the link between an asset and a goal.
///
/// Both documents are rewritten in one transaction; a validation failure on
/// either side leaves both untouched.
pub async fn set_link(
    pool: &SqlitePool,
    asset_id: i64,
    goal_id: i64,
    percent: f64,
    names: LinkNames,
) -> AppResult<()> {
    validate_percent(percent)?;
    with_write_retries("set_link", || set_link_tx(pool, asset_id, goal_id, percent, &names)).await
}

async fn remove_link_tx(pool: &SqlitePool, asset_id: i64, goal_id: i64) -> AppResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_remove_tx"))?;

    // Either row may already be gone; clean up whatever still exists.
    if let Some(mut asset) = model::get_asset(tx.as_mut(), asset_id).await? {
        let earmarks = linkdoc::decode_asset_links(&asset.custom_data);
        let kept: Vec<GoalEarmark> = earmarks
            .iter()
            .filter(|e| e.goal_id != goal_id)
            .cloned()
            .collect();
        if kept.len() != earmarks.len() {
            linkdoc::encode_asset_links(&mut asset.custom_data, &kept);
            write_asset_document(&mut tx, asset_id, &asset.custom_data).await?;
        }
    }

    if let Some(mut goal) = model::get_goal(tx.as_mut(), goal_id).await? {
        let links = linkdoc::decode_goal_links(&goal.custom_data);
        let kept: Vec<AssetLink> = links
            .iter()
            .filter(|l| l.asset_id != asset_id)
            .cloned()
            .collect();
        if kept.len() != links.len() {
            linkdoc::encode_goal_links(&mut goal.custom_data, &kept);
            write_goal_document(&mut tx, goal_id, &goal.custom_data).await?;
        }
    }

    tx.commit()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_remove_commit"))?;

    tracing::debug!(
        target = "lifesheet",
        action = "remove_link",
        asset_id = asset_id,
        goal_id = goal_id
    );

    Ok(())
}

/// Remove the link between an asset and a goal from both sides.
///
/// Succeeds as a no-op when the link does not exist.
pub async fn remove_link(pool: &SqlitePool, asset_id: i64, goal_id: i64) -> AppResult<()> {
    with_write_retries("remove_link", || remove_link_tx(pool, asset_id, goal_id)).await
}

/// Decoded earmark list of an asset; empty when the asset does not exist.
pub async fn get_links_for_asset(pool: &SqlitePool, asset_id: i64) -> AppResult<Vec<GoalEarmark>> {
    Ok(model::get_asset(pool, asset_id)
        .await?
        .map(|asset| linkdoc::decode_asset_links(&asset.custom_data))
        .unwrap_or_default())
}

/// Decoded linked-asset list of a goal; empty when the goal does not exist.
pub async fn get_links_for_goal(pool: &SqlitePool, goal_id: i64) -> AppResult<Vec<AssetLink>> {
    Ok(model::get_goal(pool, goal_id)
        .await?
        .map(|goal| linkdoc::decode_goal_links(&goal.custom_data))
        .unwrap_or_default())
}

/// All assets of a user whose earmark array contains the given goal, answered
/// by a containment scan over the JSON document.
pub async fn assets_earmarking_goal(
    pool: &SqlitePool,
    user_id: i64,
    goal_id: i64,
) -> AppResult<Vec<Asset>> {
    let rows = sqlx::query(
        "SELECT DISTINCT a.id, a.user_id, a.profile_id, a.name, a.tag, a.current_value, \
                a.custom_data, a.created_at, a.updated_at \
           FROM assets a, json_each(a.custom_data, '$.goalEarmarks') link \
          WHERE a.user_id = ?1 \
            AND json_extract(link.value, '$.goalId') = ?2 \
          ORDER BY a.id",
    )
    .bind(user_id)
    .bind(goal_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "assets_earmarking_goal")
            .with_context("goal_id", goal_id.to_string())
    })?;
    rows.iter().map(Asset::try_from).collect()
}

/// All goals of a user whose linked-asset array contains the given asset.
pub async fn goals_linked_to_asset(
    pool: &SqlitePool,
    user_id: i64,
    asset_id: i64,
) -> AppResult<Vec<FinancialGoal>> {
    let rows = sqlx::query(
        "SELECT DISTINCT g.id, g.user_id, g.name, g.target_amount, g.target_date, \
                g.target_age, g.custom_data, g.created_at, g.updated_at \
           FROM financial_goal g, json_each(g.custom_data, '$.linkedAssets') link \
          WHERE g.user_id = ?1 \
            AND json_extract(link.value, '$.assetId') = ?2 \
          ORDER BY g.id",
    )
    .bind(user_id)
    .bind(asset_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "goals_linked_to_asset")
            .with_context("asset_id", asset_id.to_string())
    })?;
    rows.iter().map(FinancialGoal::try_from).collect()
}

#[derive(Debug, Clone, Copy)]
struct PairClaim {
    percent: f64,
    updated_at: i64,
}

async fn reconcile_tx(pool: &SqlitePool, user_id: i64) -> AppResult<ReconcileReport> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_reconcile_tx"))?;

    // Lenient listing: a blob the legacy scripts corrupted must not abort the
    // repair pass. Rows whose document failed to parse are rewritten below
    // even when they end up with no links.
    let (assets, malformed_assets) = model::list_assets_lenient(tx.as_mut(), user_id).await?;
    let (goals, malformed_goals) = model::list_goals_lenient(tx.as_mut(), user_id).await?;

    let asset_names: BTreeMap<i64, &str> =
        assets.iter().map(|a| (a.id, a.name.as_str())).collect();
    let goal_names: BTreeMap<i64, &str> = goals.iter().map(|g| (g.id, g.name.as_str())).collect();

    let mut report = ReconcileReport::default();

    // Collect one claim per (asset, goal) pair from each side. Duplicate
    // entries within a document keep their first occurrence.
    let mut asset_claims: BTreeMap<(i64, i64), PairClaim> = BTreeMap::new();
    for asset in &assets {
        for earmark in linkdoc::decode_asset_links(&asset.custom_data) {
            asset_claims
                .entry((asset.id, earmark.goal_id))
                .or_insert(PairClaim {
                    percent: earmark.percent,
                    updated_at: asset.updated_at,
                });
        }
    }
    let mut goal_claims: BTreeMap<(i64, i64), PairClaim> = BTreeMap::new();
    for goal in &goals {
        for link in linkdoc::decode_goal_links(&goal.custom_data) {
            goal_claims
                .entry((link.asset_id, goal.id))
                .or_insert(PairClaim {
                    percent: link.percent,
                    updated_at: goal.updated_at,
                });
        }
    }

    // Resolve every claimed pair to a percent, or drop it.
    let mut resolved: BTreeMap<(i64, i64), f64> = BTreeMap::new();
    let mut pairs: Vec<(i64, i64)> = asset_claims.keys().copied().collect();
    for pair in goal_claims.keys() {
        if !asset_claims.contains_key(pair) {
            pairs.push(*pair);
        }
    }

    for pair in pairs {
        let (asset_id, goal_id) = pair;
        let asset_exists = asset_names.contains_key(&asset_id);
        let goal_exists = goal_names.contains_key(&goal_id);
        if !asset_exists || !goal_exists {
            report.dangling_references += 1;
            tracing::warn!(
                target = "lifesheet",
                action = "reconcile_drop_dangling",
                user_id = user_id,
                asset_id = asset_id,
                goal_id = goal_id,
                asset_exists = asset_exists,
                goal_exists = goal_exists
            );
            continue;
        }
        let percent = match (asset_claims.get(&pair), goal_claims.get(&pair)) {
            (Some(a), Some(g)) if a.percent == g.percent => a.percent,
            (Some(a), Some(g)) => {
                report.percent_conflicts += 1;
                tracing::warn!(
                    target = "lifesheet",
                    action = "reconcile_percent_conflict",
                    user_id = user_id,
                    asset_id = asset_id,
                    goal_id = goal_id,
                    asset_percent = a.percent,
                    goal_percent = g.percent
                );
                // Most recently updated side wins; the asset side on a tie.
                if g.updated_at > a.updated_at {
                    g.percent
                } else {
                    a.percent
                }
            }
            (Some(a), None) => {
                report.missing_mirrors += 1;
                tracing::warn!(
                    target = "lifesheet",
                    action = "reconcile_missing_goal_mirror",
                    user_id = user_id,
                    asset_id = asset_id,
                    goal_id = goal_id
                );
                a.percent
            }
            (None, Some(g)) => {
                report.missing_mirrors += 1;
                tracing::warn!(
                    target = "lifesheet",
                    action = "reconcile_missing_asset_mirror",
                    user_id = user_id,
                    asset_id = asset_id,
                    goal_id = goal_id
                );
                g.percent
            }
            (None, None) => unreachable!("pair collected from one of the claim maps"),
        };
        resolved.insert(pair, percent);
    }

    // Rewrite each asset document: surviving entries keep their order and
    // get refreshed labels, newly mirrored pairs append in goal-id order.
    for asset in &assets {
        let original = linkdoc::decode_asset_links(&asset.custom_data);
        let mut rebuilt: Vec<GoalEarmark> = Vec::new();
        for earmark in &original {
            let pair = (asset.id, earmark.goal_id);
            if let Some(&percent) = resolved.get(&pair) {
                if !rebuilt.iter().any(|e| e.goal_id == earmark.goal_id) {
                    rebuilt.push(GoalEarmark {
                        goal_id: earmark.goal_id,
                        goal_name: goal_names
                            .get(&earmark.goal_id)
                            .map(|name| name.to_string())
                            .unwrap_or_default(),
                        percent,
                    });
                }
            }
        }
        for (&(asset_id, goal_id), &percent) in &resolved {
            if asset_id == asset.id && !rebuilt.iter().any(|e| e.goal_id == goal_id) {
                rebuilt.push(GoalEarmark {
                    goal_id,
                    goal_name: goal_names
                        .get(&goal_id)
                        .map(|name| name.to_string())
                        .unwrap_or_default(),
                    percent,
                });
            }
        }
        let was_reset = malformed_assets.contains(&asset.id);
        if rebuilt != original || was_reset {
            let mut doc = asset.custom_data.clone();
            linkdoc::encode_asset_links(&mut doc, &rebuilt);
            write_asset_document(&mut tx, asset.id, &doc).await?;
            report.rows_rewritten += 1;
            if was_reset {
                report.documents_reset += 1;
            }
        }
    }

    // Goal side, symmetric.
    for goal in &goals {
        let original = linkdoc::decode_goal_links(&goal.custom_data);
        let mut rebuilt: Vec<AssetLink> = Vec::new();
        for link in &original {
            let pair = (link.asset_id, goal.id);
            if let Some(&percent) = resolved.get(&pair) {
                if !rebuilt.iter().any(|l| l.asset_id == link.asset_id) {
                    rebuilt.push(AssetLink {
                        asset_id: link.asset_id,
                        asset_name: asset_names
                            .get(&link.asset_id)
                            .map(|name| name.to_string())
                            .unwrap_or_default(),
                        percent,
                    });
                }
            }
        }
        for (&(asset_id, goal_id), &percent) in &resolved {
            if goal_id == goal.id && !rebuilt.iter().any(|l| l.asset_id == asset_id) {
                rebuilt.push(AssetLink {
                    asset_id,
                    asset_name: asset_names
                        .get(&asset_id)
                        .map(|name| name.to_string())
                        .unwrap_or_default(),
                    percent,
                });
            }
        }
        let was_reset = malformed_goals.contains(&goal.id);
        if rebuilt != original || was_reset {
            let mut doc = goal.custom_data.clone();
            linkdoc::encode_goal_links(&mut doc, &rebuilt);
            write_goal_document(&mut tx, goal.id, &doc).await?;
            report.rows_rewritten += 1;
            if was_reset {
                report.documents_reset += 1;
            }
        }
    }

    tx.commit()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "earmark_reconcile_commit"))?;

    if !report.is_noop() {
        tracing::info!(
            target = "lifesheet",
            action = "reconcile",
            user_id = user_id,
            missing_mirrors = report.missing_mirrors,
            dangling_references = report.dangling_references,
            percent_conflicts = report.percent_conflicts,
            documents_reset = report.documents_reset,
            rows_rewritten = report.rows_rewritten
        );
    }

    Ok(report)
}

/// Repair pass over all of one user's assets and goals: recreate missing
/// mirrors, drop references to deleted entities, resolve percent
/// disagreements toward the more recently updated row, refresh cached
/// labels, and rebuild documents that no longer parse as JSON. Idempotent;
/// a second run rewrites nothing.
pub async fn reconcile(pool: &SqlitePool, user_id: i64) -> AppResult<ReconcileReport> {
    with_write_retries("reconcile", || reconcile_tx(pool, user_id)).await
}
