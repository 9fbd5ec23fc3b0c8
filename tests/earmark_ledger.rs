use anyhow::Result;

use lifesheet::earmarks::{self, LinkNames};
use lifesheet::model;

mod util;

#[tokio::test]
async fn set_link_mirrors_both_documents() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    earmarks::set_link(&pool, asset, goal, 50.0, LinkNames::default()).await?;

    let asset_links = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(asset_links.len(), 1);
    assert_eq!(asset_links[0].goal_id, goal);
    assert_eq!(asset_links[0].percent, 50.0);
    assert_eq!(asset_links[0].goal_name, "House Deposit");

    let goal_links = earmarks::get_links_for_goal(&pool, goal).await?;
    assert_eq!(goal_links.len(), 1);
    assert_eq!(goal_links[0].asset_id, asset);
    assert_eq!(goal_links[0].percent, 50.0);
    assert_eq!(goal_links[0].asset_name, "Index Fund");
    Ok(())
}

#[tokio::test]
async fn set_link_replaces_existing_entry() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    earmarks::set_link(&pool, asset, goal, 70.0, LinkNames::default()).await?;
    earmarks::set_link(&pool, asset, goal, 40.0, LinkNames::default()).await?;

    let asset_links = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(asset_links.len(), 1);
    assert_eq!(asset_links[0].percent, 40.0);
    let goal_links = earmarks::get_links_for_goal(&pool, goal).await?;
    assert_eq!(goal_links.len(), 1);
    assert_eq!(goal_links[0].percent, 40.0);
    Ok(())
}

#[tokio::test]
async fn percent_outside_range_is_rejected_before_any_write() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    for percent in [-1.0, 100.5, f64::NAN] {
        let err = earmarks::set_link(&pool, asset, goal, percent, LinkNames::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EARMARK/INVALID_PERCENT");
    }

    assert!(earmarks::get_links_for_asset(&pool, asset).await?.is_empty());
    assert!(earmarks::get_links_for_goal(&pool, goal).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn over_allocating_the_asset_leaves_both_sides_unchanged() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal1 = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;
    let goal2 = util::seed_goal(&pool, user, "Retirement", 500_000.0).await;

    earmarks::set_link(&pool, asset, goal1, 70.0, LinkNames::default()).await?;
    let err = earmarks::set_link(&pool, asset, goal2, 40.0, LinkNames::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EARMARK/OVER_ALLOCATED");

    let asset_links = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(asset_links.len(), 1);
    assert_eq!(asset_links[0].goal_id, goal1);
    assert_eq!(asset_links[0].percent, 70.0);
    assert!(earmarks::get_links_for_goal(&pool, goal2).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn over_allocating_the_goal_side_is_also_rejected() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset1 = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let asset2 = util::seed_asset(&pool, user, "Bonds", 50_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    earmarks::set_link(&pool, asset1, goal, 70.0, LinkNames::default()).await?;
    let err = earmarks::set_link(&pool, asset2, goal, 40.0, LinkNames::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EARMARK/OVER_ALLOCATED");

    let goal_links = earmarks::get_links_for_goal(&pool, goal).await?;
    assert_eq!(goal_links.len(), 1);
    assert_eq!(goal_links[0].asset_id, asset1);
    assert!(earmarks::get_links_for_asset(&pool, asset2).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn allocating_exactly_one_hundred_percent_is_allowed() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal1 = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;
    let goal2 = util::seed_goal(&pool, user, "Retirement", 500_000.0).await;

    earmarks::set_link(&pool, asset, goal1, 60.0, LinkNames::default()).await?;
    earmarks::set_link(&pool, asset, goal2, 40.0, LinkNames::default()).await?;

    let asset_links = earmarks::get_links_for_asset(&pool, asset).await?;
    let total: f64 = asset_links.iter().map(|e| e.percent).sum();
    assert_eq!(total, 100.0);
    Ok(())
}

#[tokio::test]
async fn set_link_against_missing_entities_fails() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    let err = earmarks::set_link(&pool, 9_999, goal, 10.0, LinkNames::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EARMARK/ENTITY_NOT_FOUND");
    let err = earmarks::set_link(&pool, asset, 9_999, 10.0, LinkNames::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EARMARK/ENTITY_NOT_FOUND");

    assert!(earmarks::get_links_for_goal(&pool, goal).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn remove_link_is_idempotent() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal1 = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;
    let goal2 = util::seed_goal(&pool, user, "Retirement", 500_000.0).await;

    earmarks::set_link(&pool, asset, goal1, 30.0, LinkNames::default()).await?;
    earmarks::set_link(&pool, asset, goal2, 20.0, LinkNames::default()).await?;

    earmarks::remove_link(&pool, asset, goal1).await?;
    let after_first = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].goal_id, goal2);
    assert!(earmarks::get_links_for_goal(&pool, goal1).await?.is_empty());

    earmarks::remove_link(&pool, asset, goal1).await?;
    let after_second = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(after_second, after_first);
    Ok(())
}

#[tokio::test]
async fn set_link_preserves_unrelated_document_keys() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    util::put_asset_document(
        &pool,
        asset,
        r#"{"sipAmount": 500, "expectedReturn": 8}"#,
        lifesheet::now_ms(),
    )
    .await;

    earmarks::set_link(&pool, asset, goal, 25.0, LinkNames::default()).await?;

    let doc = util::raw_asset_document(&pool, asset).await;
    assert_eq!(doc["sipAmount"], 500);
    assert_eq!(doc["expectedReturn"], 8);
    assert_eq!(doc["goalEarmarks"][0]["goalId"], serde_json::json!(goal));
    Ok(())
}

#[tokio::test]
async fn display_name_overrides_are_cached_in_the_documents() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    let names = LinkNames {
        asset_name: Some("My Fund".into()),
        goal_name: Some("First Home".into()),
    };
    earmarks::set_link(&pool, asset, goal, 10.0, names).await?;

    let asset_links = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(asset_links[0].goal_name, "First Home");
    let goal_links = earmarks::get_links_for_goal(&pool, goal).await?;
    assert_eq!(goal_links[0].asset_name, "My Fund");
    Ok(())
}

#[tokio::test]
async fn remove_link_tolerates_a_deleted_asset_row() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    earmarks::set_link(&pool, asset, goal, 30.0, LinkNames::default()).await?;
    sqlx::query("DELETE FROM assets WHERE id = ?1")
        .bind(asset)
        .execute(&pool)
        .await?;

    earmarks::remove_link(&pool, asset, goal).await?;
    assert!(earmarks::get_links_for_goal(&pool, goal).await?.is_empty());

    // Still a no-op once both sides are clean.
    earmarks::remove_link(&pool, asset, goal).await?;
    Ok(())
}

#[tokio::test]
async fn remove_link_tolerates_a_deleted_goal_row() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    earmarks::set_link(&pool, asset, goal, 30.0, LinkNames::default()).await?;
    sqlx::query("DELETE FROM financial_goal WHERE id = ?1")
        .bind(goal)
        .execute(&pool)
        .await?;

    earmarks::remove_link(&pool, asset, goal).await?;
    assert!(earmarks::get_links_for_asset(&pool, asset).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn held_write_lock_surfaces_conflict_after_bounded_retries() -> Result<()> {
    let (_dir, pool) = util::contended_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let goal = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;

    let mut blocker = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(blocker.as_mut()).await?;

    let err = earmarks::set_link(&pool, asset, goal, 10.0, LinkNames::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EARMARK/CONFLICT");
    assert_eq!(err.context().get("operation"), Some(&"set_link".to_string()));
    assert_eq!(err.context().get("attempts"), Some(&"3".to_string()));
    assert!(err.cause().is_some());

    // Nothing was committed while the lock was held.
    assert!(earmarks::get_links_for_asset(&pool, asset).await?.is_empty());

    // Releasing the lock lets the same call through.
    sqlx::query("ROLLBACK").execute(blocker.as_mut()).await?;
    drop(blocker);
    earmarks::set_link(&pool, asset, goal, 10.0, LinkNames::default()).await?;
    let links = earmarks::get_links_for_asset(&pool, asset).await?;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].percent, 10.0);
    Ok(())
}

#[tokio::test]
async fn containment_queries_answer_both_directions() -> Result<()> {
    let pool = util::temp_pool().await;
    let user = util::seed_user(&pool, "ana").await;
    let asset1 = util::seed_asset(&pool, user, "Index Fund", 100_000.0).await;
    let asset2 = util::seed_asset(&pool, user, "Bonds", 50_000.0).await;
    let asset3 = util::seed_asset(&pool, user, "Cash", 10_000.0).await;
    let goal1 = util::seed_goal(&pool, user, "House Deposit", 200_000.0).await;
    let goal2 = util::seed_goal(&pool, user, "Retirement", 500_000.0).await;

    earmarks::set_link(&pool, asset1, goal1, 50.0, LinkNames::default()).await?;
    earmarks::set_link(&pool, asset2, goal1, 25.0, LinkNames::default()).await?;
    earmarks::set_link(&pool, asset1, goal2, 30.0, LinkNames::default()).await?;

    let funders = earmarks::assets_earmarking_goal(&pool, user, goal1).await?;
    let funder_ids: Vec<i64> = funders.iter().map(|a| a.id).collect();
    assert_eq!(funder_ids, vec![asset1, asset2]);

    let targets = earmarks::goals_linked_to_asset(&pool, user, asset1).await?;
    let target_ids: Vec<i64> = targets.iter().map(|g| g.id).collect();
    assert_eq!(target_ids, vec![goal1, goal2]);

    assert!(earmarks::goals_linked_to_asset(&pool, user, asset3)
        .await?
        .is_empty());

    // The full listings see every row, linked or not, in id order.
    let all_assets = model::list_assets(&pool, user).await?;
    let all_ids: Vec<i64> = all_assets.iter().map(|a| a.id).collect();
    assert_eq!(all_ids, vec![asset1, asset2, asset3]);
    let all_goals = model::list_goals(&pool, user).await?;
    assert_eq!(all_goals.len(), 2);
    Ok(())
}
