use super::*;
use time::macros::datetime;

async fn make_repo() -> SqliteRepository {
    SqliteRepository::in_memory().await.unwrap()
}

#[tokio::test]
async fn create_and_fetch_owner() {
    let repo = make_repo().await;
    let mut owner = OwnerRecord::new("76561197960287930");
    owner.display_name = Some("gordon".into());
    owner.last_full_sync = Some(datetime!(2024-03-01 12:00 UTC));

    let created = repo.create_owner(&owner).await.unwrap();
    assert!(created.library_id > 0);
    assert_eq!(created.display_name.as_deref(), Some("gordon"));
    assert_eq!(created.last_full_sync, owner.last_full_sync);
    assert_eq!(created.last_incremental_sync, None);

    let fetched = repo
        .get_owner_by_id("76561197960287930")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn create_owner_is_idempotent() {
    let repo = make_repo().await;
    let first = repo.create_owner(&OwnerRecord::new("a")).await.unwrap();
    let second = repo.create_owner(&OwnerRecord::new("a")).await.unwrap();

    assert_eq!(first.library_id, second.library_id);
    assert_eq!(repo.get_all_owners().await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_owner_persists_sync_flags() {
    let repo = make_repo().await;
    let mut owner = repo.create_owner(&OwnerRecord::new("a")).await.unwrap();
    owner.sync_in_progress = true;
    owner.total_games = 12;
    repo.update_owner(&owner).await.unwrap();

    let fetched = repo.get_owner_by_id("a").await.unwrap().unwrap();
    assert!(fetched.sync_in_progress);
    assert_eq!(fetched.total_games, 12);
}

#[tokio::test]
async fn update_missing_owner_fails() {
    let repo = make_repo().await;
    let err = repo
        .update_owner(&OwnerRecord::new("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::OwnerNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn game_round_trips_all_columns() {
    let repo = make_repo().await;
    repo.create_owner(&OwnerRecord::new("a")).await.unwrap();

    let mut game = GameRecord::new("a", 620, "Portal 2");
    game.developers = vec!["Valve".into()];
    game.genres = vec!["Action".into(), "Adventure".into()];
    game.metacritic_score = Some(95);
    game.playtime_forever = 1200;
    game.last_played = Some(1_700_000_000);
    game.custom_tags = vec!["co-op".into()];
    game.custom_notes = Some("finish the DLC".into());
    game.custom_rating = Some(9);
    game.last_synced_at = Some(datetime!(2024-03-01 12:00 UTC));

    let created = repo.create_game(&game).await.unwrap();
    assert!(created.id > 0);

    let expected = GameRecord {
        id: created.id,
        ..game
    };
    assert_eq!(created, expected);
    assert_eq!(
        repo.get_game_by_id(created.id).await.unwrap(),
        Some(expected)
    );
}

#[tokio::test]
async fn create_game_twice_keeps_existing_row() {
    let repo = make_repo().await;
    repo.create_owner(&OwnerRecord::new("a")).await.unwrap();

    let mut game = GameRecord::new("a", 10, "Counter-Strike");
    game.custom_notes = Some("mine".into());
    let first = repo.create_game(&game).await.unwrap();

    let replay = GameRecord::new("a", 10, "Counter-Strike");
    let second = repo.create_game(&replay).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.custom_notes.as_deref(), Some("mine"));
}

#[tokio::test]
async fn update_and_delete_game() {
    let repo = make_repo().await;
    repo.create_owner(&OwnerRecord::new("a")).await.unwrap();
    let mut game = repo
        .create_game(&GameRecord::new("a", 70, "Half-Life"))
        .await
        .unwrap();

    game.playtime_forever = 42;
    game.custom_tags = vec!["classic".into()];
    repo.update_game(&game).await.unwrap();

    let fetched = repo.get_game("a", 70).await.unwrap().unwrap();
    assert_eq!(fetched.playtime_forever, 42);
    assert_eq!(fetched.custom_tags, vec!["classic".to_string()]);

    repo.delete_game(game.id).await.unwrap();
    assert!(repo.get_game("a", 70).await.unwrap().is_none());
    assert!(matches!(
        repo.update_game(&game).await,
        Err(RepositoryError::GameNotFound(_))
    ));
}

#[tokio::test]
async fn games_are_scoped_to_owner() {
    let repo = make_repo().await;
    repo.create_owner(&OwnerRecord::new("a")).await.unwrap();
    repo.create_owner(&OwnerRecord::new("b")).await.unwrap();
    repo.create_game(&GameRecord::new("a", 20, "Team Fortress Classic"))
        .await
        .unwrap();
    repo.create_game(&GameRecord::new("a", 10, "Counter-Strike"))
        .await
        .unwrap();
    repo.create_game(&GameRecord::new("b", 10, "Counter-Strike"))
        .await
        .unwrap();

    let games = repo.get_games_by_owner("a").await.unwrap();
    let ids: Vec<u32> = games.iter().map(|g| g.app_id).collect();
    assert_eq!(ids, vec![10, 20]);
}

#[tokio::test]
async fn open_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("library.sqlite3");
    let repo = SqliteRepository::open(&path).await.unwrap();
    repo.create_owner(&OwnerRecord::new("a")).await.unwrap();
    assert!(path.exists());
}

#[test]
fn stats_cover_played_and_total() {
    let mut owner = OwnerRecord::new("a");
    let mut played = GameRecord::new("a", 1, "One");
    played.playtime_forever = 90;
    let unplayed = GameRecord::new("a", 2, "Two");

    owner.recompute_stats(&[played, unplayed]);

    assert_eq!(owner.total_games, 2);
    assert_eq!(owner.played_games, 1);
    assert_eq!(owner.total_playtime_minutes, 90);
}
