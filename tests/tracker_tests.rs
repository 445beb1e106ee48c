//! Progress tracker and leaderboard scenarios against the in-memory store.
//!
//! Covers the state machine end to end, concurrent start/complete races
//! from multiple devices, stale-attempt expiry, storage faults after a
//! committed completion, resumable game state, and that both standings
//! strategies agree.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use utsav::config::StandingsStrategy;
use utsav::error::EngineError;
use utsav::leaderboard::{ComputeOnRead, LeaderboardAggregator, LeaderboardFilter, ScoreRule};
use utsav::memory::MemoryStore;
use utsav::model::{Completion, NewProgress, Outcome, ProgressState};
use utsav::retry::RetryPolicy;
use utsav::server::AppState;
use utsav::store::ProgressStore;

use common::{FlakyStore, TestApp};

// == State machine =============================================================

#[tokio::test]
async fn start_complete_advance_then_restart_is_rejected() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551000", "U");
    let tracker = &app.state.tracker;
    let event_id = app.event.event_id;
    let (l1, l2) = (app.level_id(1), app.level_id(2));

    let started = tracker.start_level(user.user_id, event_id, l1, None).await.unwrap();
    assert_eq!(started.state, ProgressState::InProgress);

    let done = tracker
        .complete_level(
            user.user_id,
            event_id,
            l1,
            started.progress_id,
            json!({ "score": 10 }),
            true,
            None,
        )
        .await
        .unwrap();
    assert_eq!(done.state, ProgressState::Completed(Outcome::Passed));
    assert_eq!(done.progress_id, started.progress_id);

    tracker.start_level(user.user_id, event_id, l2, None).await.unwrap();

    match tracker.start_level(user.user_id, event_id, l1, None).await {
        Err(EngineError::AlreadyCompleted { progress_id, .. }) => {
            assert_eq!(progress_id, started.progress_id)
        }
        other => panic!("expected AlreadyCompleted, got {:?}", other.map(|s| s.state)),
    }
}

#[tokio::test]
async fn unknown_level_is_not_found() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551001", "U");
    let err = app
        .state
        .tracker
        .start_level(user.user_id, app.event.event_id, 424242, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn completion_records_result_and_device_info() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551002", "U");
    let tracker = &app.state.tracker;
    let event_id = app.event.event_id;
    let l1 = app.level_id(1);

    let started = tracker
        .start_level(user.user_id, event_id, l1, Some(json!({ "device": "phone" })))
        .await
        .unwrap();
    tracker
        .complete_level(
            user.user_id,
            event_id,
            l1,
            started.progress_id,
            json!({ "score": 3, "moves": 12 }),
            true,
            Some(json!({ "device": "tablet" })),
        )
        .await
        .unwrap();

    let records = tracker.get_progress(user.user_id, event_id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.result_data, Some(json!({ "score": 3, "moves": 12 })));
    assert_eq!(record.device_info, Some(json!({ "device": "tablet" })));
    assert!(record.time_taken_seconds.unwrap() >= 0);
    assert!(record.completed_at.unwrap() >= record.started_at);
}

// == Concurrency ===============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_succeed_exactly_once() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551010", "Racer");
    let event_id = app.event.event_id;
    let l1 = app.level_id(1);
    let started = app
        .state
        .tracker
        .start_level(user.user_id, event_id, l1, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = Arc::clone(&app.state);
        let progress_id = started.progress_id;
        let user_id = user.user_id;
        handles.push(tokio::spawn(async move {
            state
                .tracker
                .complete_level(user_id, event_id, l1, progress_id, json!({}), true, None)
                .await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.state, ProgressState::Completed(Outcome::Passed));
                ok += 1;
            }
            Err(EngineError::InvalidProgressId(id)) => assert_eq!(id, started.progress_id),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(ok, 1);

    let board = app
        .state
        .leaderboard
        .get_leaderboard(event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    assert_eq!(board.entries.len(), 1);
    assert_eq!(board.entries[0].levels_completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_share_one_attempt() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551011", "Starter");
    let event_id = app.event.event_id;
    let l1 = app.level_id(1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = Arc::clone(&app.state);
        let user_id = user.user_id;
        handles.push(tokio::spawn(async move {
            state.tracker.start_level(user_id, event_id, l1, None).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    let first = outcomes[0].progress_id;
    assert!(outcomes.iter().all(|o| o.progress_id == first));
    assert_eq!(outcomes.iter().filter(|o| !o.resumed).count(), 1);

    let records = app.state.tracker.get_progress(user.user_id, event_id).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_users_progress_independently() {
    let app = TestApp::new();
    let event_id = app.event.event_id;
    let l1 = app.level_id(1);

    let mut handles = Vec::new();
    for i in 0..16 {
        let (user, _) = app.sign_in(&format!("+1555102{:02}", i), &format!("Player {}", i));
        let state = Arc::clone(&app.state);
        handles.push(tokio::spawn(async move {
            let started = state.tracker.start_level(user.user_id, event_id, l1, None).await?;
            state
                .tracker
                .complete_level(
                    user.user_id,
                    event_id,
                    l1,
                    started.progress_id,
                    json!({ "score": i }),
                    true,
                    None,
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let board = app
        .state
        .leaderboard
        .get_leaderboard(event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    assert_eq!(board.total, 16);
    assert_eq!(board.total_participants, 16);
    assert_eq!(board.entries[0].total_score, 15.0);
    assert_eq!(board.entries[15].total_score, 0.0);
}

// == Ranking ===================================================================

/// Write a passed attempt with fixed timestamps straight through the store.
async fn seed_pass(app: &TestApp, user_id: uuid::Uuid, order: usize, score: i64, finished: (u32, u32)) {
    let completed_at = Utc.with_ymd_and_hms(2026, 3, 14, finished.0, finished.1, 0).unwrap();
    let started_at = completed_at - chrono::Duration::minutes(5);
    let new = NewProgress {
        progress_id: uuid::Uuid::new_v4(),
        user_id,
        event_id: app.event.event_id,
        level_id: app.level_id(order),
        started_at,
        device_info: None,
    };
    let (record, created) = app.store.insert_progress(&new).await.unwrap();
    assert!(created);
    let completion = Completion {
        progress_id: record.progress_id,
        user_id,
        outcome: Outcome::Passed,
        completed_at,
        time_taken_seconds: 300,
        result_data: json!({ "score": score }),
        device_info: None,
    };
    let done = app.store.complete_progress(&completion).await.unwrap().unwrap();
    app.state.leaderboard.record_completion(&done).await.unwrap();
}

async fn tie_broken_by_earlier_finish(strategy: StandingsStrategy) {
    let app = TestApp::with_strategy(strategy);
    let (a, _) = app.sign_in("+15551030", "A");
    let (b, _) = app.sign_in("+15551031", "B");

    seed_pass(&app, a.user_id, 1, 75, (9, 30)).await;
    seed_pass(&app, a.user_id, 2, 75, (10, 0)).await;
    seed_pass(&app, b.user_id, 1, 100, (9, 20)).await;
    seed_pass(&app, b.user_id, 2, 50, (9, 55)).await;

    let board = app
        .state
        .leaderboard
        .get_leaderboard(app.event.event_id, &LeaderboardFilter::All, None, None, Some(a.user_id))
        .await
        .unwrap();
    let order: Vec<&str> = board.entries.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(order, vec!["B", "A"]);
    assert_eq!(board.entries[0].total_score, 150.0);
    assert_eq!(board.entries[1].total_score, 150.0);
    assert_eq!(board.current_user_rank, Some(2));

    let mine = app
        .state
        .leaderboard
        .get_my_rank(app.event.event_id, a.user_id)
        .await
        .unwrap();
    assert_eq!(mine.rank, 2);
    assert_eq!(mine.total, 2);
}

#[tokio::test]
async fn tie_broken_by_earlier_finish_on_read() {
    tie_broken_by_earlier_finish(StandingsStrategy::OnRead).await;
}

#[tokio::test]
async fn tie_broken_by_earlier_finish_incremental() {
    tie_broken_by_earlier_finish(StandingsStrategy::Incremental).await;
}

#[tokio::test]
async fn repeated_reads_are_identical() {
    let app = TestApp::new();
    for i in 0..6 {
        let (user, _) = app.sign_in(&format!("+1555104{}", i), &format!("Same {}", i));
        seed_pass(&app, user.user_id, 1, 10, (12, 0)).await;
    }
    let event_id = app.event.event_id;
    let first = app
        .state
        .leaderboard
        .get_leaderboard(event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    let second = app
        .state
        .leaderboard
        .get_leaderboard(event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    assert_eq!(first.entries, second.entries);

    // Pages concatenate to the full ranking.
    let mut paged = Vec::new();
    for offset in (0..6).step_by(2) {
        let page = app
            .state
            .leaderboard
            .get_leaderboard(event_id, &LeaderboardFilter::All, Some(2), Some(offset), None)
            .await
            .unwrap();
        paged.extend(page.entries);
    }
    assert_eq!(paged, first.entries);
}

#[tokio::test]
async fn failed_attempts_do_not_rank() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551050", "Unlucky");
    let tracker = &app.state.tracker;
    let started = tracker
        .start_level(user.user_id, app.event.event_id, app.level_id(1), None)
        .await
        .unwrap();
    tracker
        .complete_level(
            user.user_id,
            app.event.event_id,
            app.level_id(1),
            started.progress_id,
            json!({ "score": 999 }),
            false,
            None,
        )
        .await
        .unwrap();

    let board = app
        .state
        .leaderboard
        .get_leaderboard(app.event.event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    assert!(board.entries.is_empty());
    assert_eq!(board.total_participants, 1);
}

// == Stale attempts ============================================================

#[tokio::test]
async fn stale_attempts_are_failed() {
    let app = TestApp::with_strategy(StandingsStrategy::Incremental);
    let (user, _) = app.sign_in("+15551060", "Idle");
    let tracker = &app.state.tracker;
    let started = tracker
        .start_level(user.user_id, app.event.event_id, app.level_id(1), None)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let expired = tracker
        .expire_stale_attempts(chrono::Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].progress_id, started.progress_id);
    assert_eq!(expired[0].state, ProgressState::Completed(Outcome::Failed));
    assert_eq!(expired[0].result_data, Some(json!({ "reason": "timeout" })));

    // The expired attempt can no longer be completed or restarted.
    let err = tracker
        .complete_level(
            user.user_id,
            app.event.event_id,
            app.level_id(1),
            started.progress_id,
            json!({}),
            true,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidProgressId(_)));

    // A second sweep finds nothing.
    let again = tracker
        .expire_stale_attempts(chrono::Duration::milliseconds(1))
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn fresh_attempts_survive_sweep() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551061", "Busy");
    app.state
        .tracker
        .start_level(user.user_id, app.event.event_id, app.level_id(1), None)
        .await
        .unwrap();
    let expired = app
        .state
        .tracker
        .expire_stale_attempts(chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(expired.is_empty());
}

// == Strategies ================================================================

#[tokio::test]
async fn strategies_agree_after_live_play() {
    let on_read = TestApp::with_strategy(StandingsStrategy::OnRead);
    let incremental = TestApp::with_strategy(StandingsStrategy::Incremental);

    for app in [&on_read, &incremental] {
        for (i, levels) in [3usize, 1, 2, 2].iter().enumerate() {
            let (user, _) = app.sign_in(&format!("+1555107{}", i), &format!("S{}", i));
            for order in 1..=*levels {
                let started = app
                    .state
                    .tracker
                    .start_level(user.user_id, app.event.event_id, app.level_id(order), None)
                    .await
                    .unwrap();
                app.state
                    .tracker
                    .complete_level(
                        user.user_id,
                        app.event.event_id,
                        app.level_id(order),
                        started.progress_id,
                        json!({ "score": (i + 1) * 10 }),
                        true,
                        None,
                    )
                    .await
                    .unwrap();
            }
        }
    }

    let summary = |board: utsav::leaderboard::Leaderboard| -> Vec<(String, usize, f64)> {
        board
            .entries
            .into_iter()
            .map(|e| (e.display_name, e.levels_completed, e.total_score))
            .collect()
    };
    let a = on_read
        .state
        .leaderboard
        .get_leaderboard(on_read.event.event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    let b = incremental
        .state
        .leaderboard
        .get_leaderboard(incremental.event.event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    let (a, b) = (summary(a), summary(b));
    assert_eq!(a, b);
    assert_eq!(a[0].0, "S0");
    assert_eq!(a[0].1, 3);
    // S2 and S3 both have two levels; S3 scored more.
    assert_eq!(a[1].0, "S3");
    assert_eq!(a[2].0, "S2");
}

// == Storage faults ============================================================

struct FlakyApp {
    state: Arc<AppState>,
    memory: Arc<MemoryStore>,
    flaky: Arc<FlakyStore>,
    event_id: i64,
    levels: Vec<i64>,
}

fn flaky_app(strategy: StandingsStrategy) -> FlakyApp {
    let memory = Arc::new(MemoryStore::new());
    let event = memory.add_event("Flaky", "FLAKY");
    let levels = (1..=3)
        .map(|order| memory.add_level(event.event_id, order, "quiz", order == 3).level_id)
        .collect();
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let state = AppState::build(flaky.clone(), common::test_config(strategy));
    FlakyApp {
        state,
        memory,
        flaky,
        event_id: event.event_id,
        levels,
    }
}

#[tokio::test]
async fn committed_completion_with_lost_ack_succeeds() {
    let app = flaky_app(StandingsStrategy::Incremental);
    let user = app.memory.add_user("+15551100", "Lossy");
    let tracker = &app.state.tracker;

    // Warm the incremental cache so a skipped update would stay missing.
    let warm = app
        .state
        .leaderboard
        .get_leaderboard(app.event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    assert!(warm.entries.is_empty());

    let started = tracker
        .start_level(user.user_id, app.event_id, app.levels[0], None)
        .await
        .unwrap();
    app.flaky.lose_next_ack.store(true, Ordering::SeqCst);
    let done = tracker
        .complete_level(
            user.user_id,
            app.event_id,
            app.levels[0],
            started.progress_id,
            json!({ "score": 70 }),
            true,
            None,
        )
        .await
        .unwrap();
    assert_eq!(done.state, ProgressState::Completed(Outcome::Passed));
    assert_eq!(done.rank, Some(1));
    assert!(!app.flaky.lose_next_ack.load(Ordering::SeqCst));

    let stored = app.memory.get_progress(started.progress_id).await.unwrap().unwrap();
    assert_eq!(stored.completed_at, Some(done.completed_at));

    let incremental = app
        .state
        .leaderboard
        .get_leaderboard(app.event_id, &LeaderboardFilter::All, None, None, None)
        .await
        .unwrap();
    let recomputed = LeaderboardAggregator::new(
        app.memory.clone(),
        Arc::new(ComputeOnRead::new(app.memory.clone(), ScoreRule::default())),
        RetryPolicy::new(1, Duration::from_millis(1)),
    )
    .get_leaderboard(app.event_id, &LeaderboardFilter::All, None, None, None)
    .await
    .unwrap();
    assert_eq!(incremental.entries, recomputed.entries);
    assert_eq!(incremental.entries[0].total_score, 70.0);
}

#[tokio::test]
async fn completion_survives_failed_next_level_lookup() {
    let app = flaky_app(StandingsStrategy::OnRead);
    let user = app.memory.add_user("+15551101", "Catalog");
    let tracker = &app.state.tracker;
    let started = tracker
        .start_level(user.user_id, app.event_id, app.levels[0], None)
        .await
        .unwrap();

    app.flaky.fail_levels.store(true, Ordering::SeqCst);
    let done = tracker
        .complete_level(
            user.user_id,
            app.event_id,
            app.levels[0],
            started.progress_id,
            json!({ "score": 5 }),
            true,
            None,
        )
        .await
        .unwrap();
    assert_eq!(done.state, ProgressState::Completed(Outcome::Passed));
    assert!(done.next_level.is_none());

    let stored = app.memory.get_progress(started.progress_id).await.unwrap().unwrap();
    assert!(stored.state.is_passed());
}

// == Resumable game state ======================================================

#[tokio::test]
async fn saved_game_state_is_returned_on_resume() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551110", "Resumer");
    let (other, _) = app.sign_in("+15551111", "Other");
    let tracker = &app.state.tracker;
    let (event_id, l1) = (app.event.event_id, app.level_id(1));

    let started = tracker.start_level(user.user_id, event_id, l1, None).await.unwrap();
    assert!(started.game_state.is_none());

    let snapshot = json!({ "flipped": [1, 4], "moves": 6 });
    let saved = tracker
        .save_game_state(user.user_id, event_id, l1, started.progress_id, snapshot.clone())
        .await
        .unwrap();
    assert_eq!(saved.game_state, Some(snapshot.clone()));
    assert_eq!(saved.state, ProgressState::InProgress);

    let resumed = tracker.start_level(user.user_id, event_id, l1, None).await.unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.game_state, Some(snapshot));

    let err = tracker
        .save_game_state(other.user_id, event_id, l1, started.progress_id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = tracker
        .save_game_state(user.user_id, event_id, app.level_id(2), started.progress_id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidProgressId(_)));
}

#[tokio::test]
async fn game_state_is_frozen_once_completed() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551112", "Finisher");
    let tracker = &app.state.tracker;
    let (event_id, l1) = (app.event.event_id, app.level_id(1));

    let started = tracker.start_level(user.user_id, event_id, l1, None).await.unwrap();
    tracker
        .save_game_state(user.user_id, event_id, l1, started.progress_id, json!({ "step": 1 }))
        .await
        .unwrap();
    tracker
        .complete_level(user.user_id, event_id, l1, started.progress_id, json!({}), true, None)
        .await
        .unwrap();

    let err = tracker
        .save_game_state(user.user_id, event_id, l1, started.progress_id, json!({ "step": 2 }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidProgressId(_)));

    let attempts = tracker.level_attempts(user.user_id, event_id, l1).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].game_state, Some(json!({ "step": 1 })));
    assert!(attempts[0].state.is_passed());
}

// == Level reads ===============================================================

#[tokio::test]
async fn level_view_and_attempts_follow_progress() {
    let app = TestApp::new();
    let (user, _) = app.sign_in("+15551120", "Reader");
    let tracker = &app.state.tracker;
    let event_id = app.event.event_id;

    let view = tracker.level_view(Some(user.user_id), event_id, app.level_id(2)).await.unwrap();
    assert!(!view.is_unlocked);
    assert!(tracker
        .level_attempts(user.user_id, event_id, app.level_id(2))
        .await
        .unwrap()
        .is_empty());

    let started = tracker
        .start_level(user.user_id, event_id, app.level_id(1), None)
        .await
        .unwrap();
    tracker
        .complete_level(user.user_id, event_id, app.level_id(1), started.progress_id, json!({}), true, None)
        .await
        .unwrap();
    let view = tracker.level_view(Some(user.user_id), event_id, app.level_id(2)).await.unwrap();
    assert!(view.is_unlocked);

    let err = tracker.level_view(None, event_id, 424242).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    let err = tracker.level_attempts(user.user_id, event_id, 424242).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
