//! Timer, disconnect and cleanup supervision, plus engine-corruption
//! recovery. These suites run the background fleet with millisecond sweeps.

mod common;

use std::time::Duration;

use cardroom::broadcast::client_sink;
use cardroom::engine::GameKind;
use cardroom::error::Error;
use cardroom::events::MatchEvent;
use cardroom::matches::model::MatchStatus;
use cardroom::portal::Portal;

use common::{drive_until_finished, fast_config, filled_match, wait_for};

#[tokio::test]
async fn ranked_turn_timeout_forfeits_the_active_side() {
    let portal = Portal::builtin(fast_config());
    portal.spawn_background();

    let (id, users) = filled_match(&portal, GameKind::SixtySix, 4, true).await;
    portal.start_game(&id, &users[0]).await.unwrap();
    let timer = portal
        .get_match(&id)
        .await
        .unwrap()
        .turn_timer
        .expect("ranked timer armed");
    let active_seat = timer.seat_idx;

    wait_for(Duration::from_secs(5), "turn timeout forfeit", || async {
        portal.get_match(&id).await.unwrap().status == MatchStatus::Forfeit
    })
    .await;

    let m = portal.get_match(&id).await.unwrap();
    assert_eq!(m.end_reason.as_deref(), Some("turnTimeout"));
    assert!(m.elo_pending);
    assert!(m.turn_timer.is_none());

    // The active seat's whole side loses, the other side wins.
    let outcome = m.outcome.expect("forfeit outcome");
    for seat in &m.seats {
        let user = seat.user_id.clone().unwrap();
        let expected = if seat.seat_idx % 2 == active_seat % 2 {
            0.0
        } else {
            1.0
        };
        assert_eq!(outcome[&user], expected, "seat {}", seat.seat_idx);
    }

    // The fence makes the sweep fire at most once; the record stays put.
    let revision = m.revision;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(portal.get_match(&id).await.unwrap().revision, revision);

    portal.shutdown().await;
}

#[tokio::test]
async fn reconnect_within_grace_keeps_the_game_alive() {
    let portal = Portal::builtin(fast_config());
    portal.spawn_background();

    // Unranked so the turn timer stays out of the picture.
    let (id, users) = filled_match(&portal, GameKind::SixtySix, 4, false).await;
    portal.start_game(&id, &users[0]).await.unwrap();

    let (tx, mut rx) = client_sink();
    portal.attach(&id, &users[0], tx).await.unwrap();

    portal.on_disconnect(&id, &users[1]).await.unwrap();
    let m = portal.get_match(&id).await.unwrap();
    assert!(m.disconnect_deadlines.contains_key(&users[1]));

    portal.on_reconnect(&id, &users[1]).await.unwrap();
    let m = portal.get_match(&id).await.unwrap();
    assert!(m.disconnect_deadlines.is_empty());

    // Outlive the grace window: nobody gets forfeited.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        portal.get_match(&id).await.unwrap().status,
        MatchStatus::InGame
    );

    let mut saw_disconnected = false;
    let mut saw_reconnected = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        match event {
            MatchEvent::PlayerDisconnected { user, .. } if user == users[1] => {
                saw_disconnected = true
            }
            MatchEvent::PlayerReconnected { user, .. } if user == users[1] => {
                saw_reconnected = true
            }
            _ => {}
        }
    }
    assert!(saw_disconnected && saw_reconnected);

    portal.shutdown().await;
}

#[tokio::test]
async fn expired_grace_refuses_reconnect_and_forfeits() {
    // No background fleet: the refusal must come from the grace clock
    // itself, not from the sweeper winning a race.
    let portal = Portal::builtin(fast_config());
    let (id, users) = filled_match(&portal, GameKind::SixtySix, 2, false).await;
    portal.start_game(&id, &users[0]).await.unwrap();

    portal.on_disconnect(&id, &users[1]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = portal.on_reconnect(&id, &users[1]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // Now let the sweeper finish the job.
    portal.spawn_background();
    wait_for(Duration::from_secs(5), "disconnect forfeit", || async {
        portal.get_match(&id).await.unwrap().status == MatchStatus::Forfeit
    })
    .await;

    let m = portal.get_match(&id).await.unwrap();
    assert_eq!(m.end_reason.as_deref(), Some("disconnectTimeout"));
    let outcome = m.outcome.unwrap();
    assert_eq!(outcome[&users[1]], 0.0);
    assert_eq!(outcome[&users[0]], 1.0);
    assert!(m.disconnect_deadlines.is_empty());

    portal.shutdown().await;
}

#[tokio::test]
async fn corrupt_engine_voids_the_match() {
    let mut config = fast_config();
    config.finished_match_grace_minutes = 0.0;
    let portal = Portal::builtin(config);

    let (id, users) = filled_match(&portal, GameKind::SixtySix, 2, false).await;
    portal.start_game(&id, &users[0]).await.unwrap();

    portal
        .store()
        .save_engine(&id, b"definitely not a snapshot".to_vec())
        .await
        .unwrap();

    let action = cardroom::engine::Action::pass();
    let err = portal
        .submit_action(&id, &users[0], &action)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineCorrupt(_)));

    let m = portal.get_match(&id).await.unwrap();
    assert_eq!(m.status, MatchStatus::Forfeit);
    assert_eq!(m.end_reason.as_deref(), Some("engineCorrupt"));
    assert!(!m.elo_pending);

    // The match is void; further play is refused.
    let err = portal
        .submit_action(&id, &users[0], &action)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Cleanup (zero grace here) removes the husk.
    portal.spawn_background();
    wait_for(Duration::from_secs(5), "void match cleanup", || async {
        portal.get_match(&id).await.is_err()
    })
    .await;
    portal.shutdown().await;
}

#[tokio::test]
async fn cleanup_deletes_concluded_matches_and_orphans() {
    let mut config = fast_config();
    config.finished_match_grace_minutes = 0.0;
    let portal = Portal::builtin(config);

    let (id, users) = filled_match(&portal, GameKind::SixtySix, 2, false).await;
    portal.start_game(&id, &users[0]).await.unwrap();
    drive_until_finished(&portal, &id, &users, 300).await;
    assert_eq!(
        portal.get_match(&id).await.unwrap().status,
        MatchStatus::Finished
    );

    // An engine snapshot whose match never existed.
    portal
        .store()
        .save_engine(&"ghost123".to_string(), vec![1, 2, 3])
        .await
        .unwrap();

    portal.spawn_background();
    wait_for(Duration::from_secs(5), "finished match cleanup", || async {
        portal.get_match(&id).await.is_err()
    })
    .await;
    wait_for(Duration::from_secs(5), "orphan engine cleanup", || async {
        !portal
            .store()
            .list_engine_ids()
            .await
            .unwrap()
            .contains(&"ghost123".to_string())
    })
    .await;

    portal.shutdown().await;
}
