//! Read-only derivation of a goal's funding position from its linked assets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{
    linkdoc::{AssetLink, GoalEarmark},
    model, AppError, AppResult,
};

/// Funding position of one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSummary {
    pub funded_amount: f64,
    /// Rounded to two decimal places.
    pub percent_funded: f64,
    /// Negative when the goal is over-funded.
    pub funding_gap: f64,
    /// Asset ids referenced by the goal that no longer exist.
    pub stale_references: Vec<i64>,
}

/// Allocation position of one asset across all of its earmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAllocation {
    pub total_earmarked: f64,
    pub unallocated_value: f64,
    pub total_allocation_percent: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derive a goal's funding position from its decoded links and the current
/// values of the user's assets. Pure; missing assets contribute zero and are
/// reported as stale instead of failing the computation.
pub fn compute_funding(
    target_amount: f64,
    links: &[AssetLink],
    asset_values: &HashMap<i64, f64>,
) -> FundingSummary {
    let mut funded_amount = 0.0;
    let mut stale_references = Vec::new();

    for link in links {
        match asset_values.get(&link.asset_id) {
            Some(value) => funded_amount += value * link.percent / 100.0,
            None => stale_references.push(link.asset_id),
        }
    }

    let percent_funded = if target_amount > 0.0 {
        round2(funded_amount / target_amount * 100.0)
    } else {
        0.0
    };

    FundingSummary {
        funded_amount,
        percent_funded,
        funding_gap: target_amount - funded_amount,
        stale_references,
    }
}

/// Derive an asset's allocation position from its earmark list.
pub fn compute_asset_allocation(current_value: f64, earmarks: &[GoalEarmark]) -> AssetAllocation {
    let total_allocation_percent: f64 = earmarks.iter().map(|e| e.percent).sum();
    let total_earmarked = current_value * total_allocation_percent / 100.0;
    AssetAllocation {
        total_earmarked,
        unallocated_value: current_value - total_earmarked,
        total_allocation_percent,
    }
}

/// Load a goal and the current values of its user's assets, then delegate to
/// [`compute_funding`].
pub async fn funding_for_goal(pool: &SqlitePool, goal_id: i64) -> AppResult<FundingSummary> {
    let goal = model::get_goal(pool, goal_id).await?.ok_or_else(|| {
        AppError::new("EARMARK/ENTITY_NOT_FOUND", "Goal not found")
            .with_context("goal_id", goal_id.to_string())
    })?;
    let values = model::asset_values(pool, goal.user_id).await?;
    let links = crate::linkdoc::decode_goal_links(&goal.custom_data);
    let summary = compute_funding(goal.target_amount, &links, &values);
    if !summary.stale_references.is_empty() {
        tracing::warn!(
            target = "lifesheet",
            action = "funding_stale_references",
            goal_id = goal_id,
            stale = summary.stale_references.len()
        );
    }
    Ok(summary)
}
