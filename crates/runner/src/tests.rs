use crate::build::BuildExecutor;
use crate::cache::VillageCache;
use crate::scanner::{ScanError, Scanner};
use crate::selector::{completed_resource_tasks, select_lowest_field, ResourceAmounts};
use crate::testing::{FakeGame, MemStore};
use crate::train::TrainExecutor;
use farmhand_protocol::{BuildingKind, ResourceKind, TroopSpec};
use std::time::Duration;

fn scanner() -> Scanner {
    Scanner {
        retries: 3,
        backoff: Duration::from_secs(3),
    }
}

fn stock() -> ResourceAmounts {
    ResourceAmounts::from([(ResourceKind::Crop, 50), (ResourceKind::Wood, 500)])
}

#[tokio::test(start_paused = true)]
async fn lowest_crop_field_wins_with_slot_tie_break() {
    let game = FakeGame::village().with_crop_levels([3, 4, 3, 5]);
    let mut cache = VillageCache::new();
    scanner().scan(&game, &mut cache).await.unwrap();

    let tasks = vec![MemStore::resource("crop", ResourceKind::Crop, 5, 10)];
    let pick = select_lowest_field(&cache, &tasks, &stock()).unwrap();
    assert_eq!((pick.slot, pick.level, pick.kind), (4, 3, ResourceKind::Crop));

    let again = select_lowest_field(&cache, &tasks, &stock()).unwrap();
    assert_eq!(again, pick);
}

#[tokio::test(start_paused = true)]
async fn slot_eighteen_failing_every_attempt_commits_nothing() {
    let mut game = FakeGame::village();
    game.failing_slot = Some(18);
    let mut cache = VillageCache::new();

    let err = scanner().scan(&game, &mut cache).await.unwrap_err();
    assert!(matches!(err, ScanError::Incomplete { found: 17, expected: 18 }));
    assert_eq!(err.to_string(), "SCAN_INCOMPLETE_RETRY");
    assert!(!cache.is_valid());
    assert_eq!(game.reads(), 54);
}

#[tokio::test(start_paused = true)]
async fn failed_rescan_keeps_the_previous_fields() {
    let mut game = FakeGame::village();
    let mut cache = VillageCache::new();
    scanner().scan(&game, &mut cache).await.unwrap();
    let before = cache.fields().unwrap().to_vec();

    game.failing_slot = Some(7);
    assert!(scanner().scan_if_needed(&game, &mut cache, true).await.is_err());
    assert_eq!(cache.fields().unwrap(), before.as_slice());
}

#[tokio::test(start_paused = true)]
async fn started_upgrade_touches_only_its_slot() {
    let game = FakeGame::village().with_crop_levels([3, 4, 3, 5]);
    let mut cache = VillageCache::new();
    scanner().scan(&game, &mut cache).await.unwrap();
    let before = cache.fields().unwrap().to_vec();

    let tasks = vec![MemStore::resource("crop", ResourceKind::Crop, 5, 10)];
    let outcome = BuildExecutor::default()
        .execute(&game, &mut cache, &tasks[0], &tasks, &stock())
        .await;
    assert!(outcome.success);
    assert_eq!((outcome.slot, outcome.new_level, outcome.status), (Some(4), Some(4), None));

    for (old, new) in before.iter().zip(cache.fields().unwrap()) {
        if old.slot == 4 {
            assert_eq!(new.level, old.level + 1);
            assert!(new.is_building);
        } else {
            assert_eq!(new, old);
        }
    }

    // Slot 4 is busy now; the other level-3 field is next.
    let next = select_lowest_field(&cache, &tasks, &stock()).unwrap();
    assert_eq!(next.slot, 12);
}

#[tokio::test(start_paused = true)]
async fn completed_tasks_are_stable_between_calls() {
    let game = FakeGame::village().with_crop_levels([5, 5, 6, 5]);
    let mut cache = VillageCache::new();
    scanner().scan(&game, &mut cache).await.unwrap();

    let tasks = vec![
        MemStore::resource("crop", ResourceKind::Crop, 5, 10),
        MemStore::resource("wood", ResourceKind::Wood, 3, 10),
    ];
    let first: Vec<&str> = completed_resource_tasks(&cache, &tasks).iter().map(|t| t.id.as_str()).collect();
    let second: Vec<&str> = completed_resource_tasks(&cache, &tasks).iter().map(|t| t.id.as_str()).collect();
    assert_eq!(first, vec!["crop"]);
    assert_eq!(first, second);
}

#[tokio::test]
async fn training_reports_only_what_the_page_added() {
    let mut game = FakeGame::village();
    game.accept_limit = Some(2);
    assert_eq!(game.legionnaires(), 10);

    let outcome = TrainExecutor
        .train(&game, BuildingKind::Barracks, &TroopSpec::Name("Legionario".into()), Some(5), None)
        .await;
    assert!(outcome.success);
    assert_eq!((outcome.trained, outcome.requested), (2, 5));
    assert_eq!(game.legionnaires(), 12);
}

#[tokio::test]
async fn training_that_adds_nothing_fails() {
    let mut game = FakeGame::village();
    game.accept_limit = Some(0);
    let outcome = TrainExecutor
        .train(&game, BuildingKind::Barracks, &TroopSpec::Index(1), Some(5), None)
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(farmhand_protocol::TrainReason::TrainingNotApplied));
}
