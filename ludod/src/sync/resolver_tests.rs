use super::*;
use crate::repository::{OwnerRecord, SqliteRepository};
use crate::sync::conflict::GameField;
use time::macros::datetime;

async fn setup() -> (Arc<SqliteRepository>, ConflictResolver) {
    let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
    repo.create_owner(&OwnerRecord::new("owner")).await.unwrap();
    let resolver = ConflictResolver::new(repo.clone(), ConflictResolutionConfig::default());
    (repo, resolver)
}

fn manual_config() -> ConflictResolutionConfig {
    ConflictResolutionConfig {
        auto_resolve: false,
        ..ConflictResolutionConfig::default()
    }
}

async fn stored_game(repo: &SqliteRepository, playtime: i64) -> GameRecord {
    let mut game = GameRecord::new("owner", 620, "Portal 2");
    game.playtime_forever = playtime;
    game.updated_at = datetime!(2024-01-01 00:00 UTC);
    repo.create_game(&game).await.unwrap()
}

fn remote_with_playtime(local: &GameRecord, playtime: i64) -> GameRecord {
    let mut remote = local.clone();
    remote.playtime_forever = playtime;
    remote.updated_at = datetime!(2024-02-01 00:00 UTC);
    remote
}

#[tokio::test]
async fn detect_registers_pending_conflicts() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let remote = remote_with_playtime(&local, 150);

    let detected = resolver.detect(Some(&local), Some(&remote)).await;

    assert_eq!(detected.len(), 1);
    let stored = resolver.conflict(&detected[0].id).await.unwrap();
    assert_eq!(stored.status, ConflictStatus::Pending);
    assert_eq!(stored.field, Some(GameField::PlaytimeForever));
}

#[tokio::test]
async fn resolve_unknown_id_is_not_found() {
    let (_repo, resolver) = setup().await;
    let err = resolver
        .resolve("missing", ResolutionStrategy::PreferRemote, "user")
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NotFound(id) if id == "missing"));
}

#[tokio::test]
async fn prefer_remote_then_prefer_local() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let remote = remote_with_playtime(&local, 150);

    let first = resolver.detect(Some(&local), Some(&remote)).await.remove(0);
    resolver
        .resolve(&first.id, ResolutionStrategy::PreferRemote, "user")
        .await
        .unwrap();
    let game = repo.get_game("owner", 620).await.unwrap().unwrap();
    assert_eq!(game.playtime_forever, 150);

    let resolved = resolver.conflict(&first.id).await.unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("user"));
    assert_eq!(resolved.strategy, Some(ResolutionStrategy::PreferRemote));
    assert!(resolved.resolved_at.is_some());

    let second = resolver.detect(Some(&local), Some(&remote)).await.remove(0);
    resolver
        .resolve(&second.id, ResolutionStrategy::PreferLocal, "user")
        .await
        .unwrap();
    let game = repo.get_game("owner", 620).await.unwrap().unwrap();
    assert_eq!(game.playtime_forever, 150);
}

#[tokio::test]
async fn merge_persists_maximum_playtime() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let conflict = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);

    resolver
        .resolve(&conflict.id, ResolutionStrategy::Merge, "user")
        .await
        .unwrap();

    let game = repo.get_game("owner", 620).await.unwrap().unwrap();
    assert_eq!(game.playtime_forever, 150);
    assert_eq!(resolver.backups("owner", 620).len(), 1);
    assert_eq!(resolver.backups("owner", 620)[0].game.playtime_forever, 100);
}

#[tokio::test]
async fn settled_conflicts_cannot_be_resolved_again() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let conflict = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);

    resolver.ignore(&conflict.id, "user").await.unwrap();
    let err = resolver
        .resolve(&conflict.id, ResolutionStrategy::PreferRemote, "user")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ResolveError::NotPending {
            status: ConflictStatus::Ignored,
            ..
        }
    ));
    let game = repo.get_game("owner", 620).await.unwrap().unwrap();
    assert_eq!(game.playtime_forever, 100);
}

#[tokio::test]
async fn manual_strategy_is_rejected() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let conflict = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);

    let err = resolver
        .resolve(&conflict.id, ResolutionStrategy::Manual, "user")
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::ManualStrategy(_)));
    assert!(resolver.conflict(&conflict.id).await.unwrap().is_pending());
}

#[tokio::test]
async fn failed_persistence_marks_conflict_failed() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let conflict = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);
    repo.delete_game(local.id).await.unwrap();

    let err = resolver
        .resolve(&conflict.id, ResolutionStrategy::PreferRemote, "user")
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::MissingGame { app_id: 620, .. }));
    let failed = resolver.conflict(&conflict.id).await.unwrap();
    assert_eq!(failed.status, ConflictStatus::Failed);
    assert!(failed.failure.is_some());
}

#[tokio::test]
async fn auto_resolve_skips_manual_types() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let usage = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);
    let deletion = resolver.detect(Some(&local), None).await.remove(0);

    let report = resolver.auto_resolve_all().await;

    assert_eq!(
        report,
        AutoResolveReport {
            resolved: 1,
            skipped_manual: 1,
            failed: 0,
        }
    );
    assert_eq!(
        resolver.conflict(&usage.id).await.unwrap().resolved_by.as_deref(),
        Some(AUTO_RESOLVER)
    );
    assert!(resolver.conflict(&deletion.id).await.unwrap().is_pending());
    assert!(repo.get_game("owner", 620).await.unwrap().is_some());
}

#[tokio::test]
async fn auto_resolve_counts_failures_and_continues() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let other = repo
        .create_game(&GameRecord::new("owner", 10, "Counter-Strike"))
        .await
        .unwrap();
    let mut other_remote = other.clone();
    other_remote.name = "Counter-Strike 1.6".into();

    resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await;
    resolver.detect(Some(&other), Some(&other_remote)).await;
    repo.delete_game(local.id).await.unwrap();

    let report = resolver.auto_resolve_all().await;

    assert_eq!(report.resolved, 1);
    assert_eq!(report.failed, 1);
    let renamed = repo.get_game("owner", 10).await.unwrap().unwrap();
    assert_eq!(renamed.name, "Counter-Strike 1.6");
}

#[tokio::test]
async fn resolving_deletion_removes_stored_game() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let deletion = resolver.detect(Some(&local), None).await.remove(0);

    resolver
        .resolve(&deletion.id, ResolutionStrategy::PreferRemote, "user")
        .await
        .unwrap();

    assert!(repo.get_game("owner", 620).await.unwrap().is_none());
    assert_eq!(resolver.backups("owner", 620).len(), 1);
}

#[tokio::test]
async fn reconcile_applies_policy_in_memory() {
    let (repo, resolver) = setup().await;
    let mut local = stored_game(&repo, 100).await;
    local.custom_notes = Some("mine".into());
    let mut remote = remote_with_playtime(&local, 150);
    remote.custom_notes = Some("theirs".into());
    remote.genres = vec!["Puzzle".into()];

    let outcome = resolver.reconcile(Some(&local), Some(&remote), "sync").await;

    assert_eq!(outcome.detected, 3);
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.pending, 0);
    let Reconciled::Update(merged) = outcome.action else {
        panic!("expected an update, got {:?}", outcome.action);
    };
    assert_eq!(merged.playtime_forever, 150);
    assert_eq!(merged.genres, vec!["Puzzle".to_string()]);
    assert_eq!(merged.custom_notes.as_deref(), Some("mine"));

    // persisting is left to the caller
    let stored = repo.get_game("owner", 620).await.unwrap().unwrap();
    assert_eq!(stored.playtime_forever, 100);

    let stats = resolver.statistics().await;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.resolved, 3);
    assert_eq!(stats.by_type.get(&ConflictType::UsageStat), Some(&1));
}

#[tokio::test]
async fn reconcile_without_auto_resolve_leaves_pending() {
    let (repo, resolver) = setup().await;
    resolver.update_config(manual_config());
    let local = stored_game(&repo, 100).await;

    let outcome = resolver
        .reconcile(Some(&local), Some(&remote_with_playtime(&local, 150)), "sync")
        .await;

    assert_eq!(outcome.action, Reconciled::Unchanged);
    assert_eq!(outcome.pending, 1);
    assert_eq!(
        resolver
            .conflicts(Some(ConflictStatus::Pending), Some(ConflictType::UsageStat))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn reconcile_new_and_missing_games() {
    let (repo, resolver) = setup().await;
    let remote = GameRecord::new("owner", 730, "Counter-Strike 2");

    let added = resolver.reconcile(None, Some(&remote), "sync").await;
    assert_eq!(added.action, Reconciled::Create(remote.clone()));

    let local = stored_game(&repo, 5).await;
    let removed = resolver.reconcile(Some(&local), None, "sync").await;
    assert_eq!(removed.action, Reconciled::Unchanged);
    assert_eq!(removed.pending, 1);
    assert_eq!(
        resolver
            .conflicts(None, Some(ConflictType::ResourceDeletion))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn cleanup_purges_only_old_settled_conflicts() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let settled = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);
    resolver.ignore(&settled.id, "user").await.unwrap();
    let pending = resolver.detect(Some(&local), None).await.remove(0);

    assert_eq!(resolver.cleanup_old().await, 0);

    let later = timestamp_now() + time::Duration::days(31);
    assert_eq!(resolver.cleanup_before(later).await, 1);
    assert!(resolver.conflict(&settled.id).await.is_none());
    assert!(resolver.conflict(&pending.id).await.is_some());
}

#[tokio::test]
async fn redetected_divergence_refreshes_pending_conflict() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;

    let first = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 150)))
        .await
        .remove(0);
    let again = resolver
        .detect(Some(&local), Some(&remote_with_playtime(&local, 180)))
        .await
        .remove(0);

    assert_eq!(again.id, first.id);
    assert_eq!(again.detected_at, first.detected_at);
    let pending = resolver
        .conflicts(Some(ConflictStatus::Pending), None)
        .await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].remote_value, ConflictValue::Number(Some(180)));
}

#[tokio::test]
async fn reconcile_settles_the_pending_conflict_it_repeats() {
    let (repo, resolver) = setup().await;
    resolver.update_config(manual_config());
    let local = stored_game(&repo, 100).await;
    let remote = remote_with_playtime(&local, 150);

    resolver.reconcile(Some(&local), Some(&remote), "sync").await;
    resolver.reconcile(Some(&local), Some(&remote), "sync").await;
    assert_eq!(resolver.statistics().await.pending, 1);

    resolver.update_config(ConflictResolutionConfig::default());
    let outcome = resolver.reconcile(Some(&local), Some(&remote), "sync").await;

    assert_eq!(outcome.applied, 1);
    let stats = resolver.statistics().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.resolved, 1);
}

#[tokio::test]
async fn settled_conflicts_are_not_reused() {
    let (repo, resolver) = setup().await;
    let local = stored_game(&repo, 100).await;
    let remote = remote_with_playtime(&local, 150);

    let first = resolver.detect(Some(&local), Some(&remote)).await.remove(0);
    resolver.ignore(&first.id, "user").await.unwrap();
    let second = resolver.detect(Some(&local), Some(&remote)).await.remove(0);

    assert_ne!(second.id, first.id);
    assert_eq!(resolver.statistics().await.total, 2);
}
