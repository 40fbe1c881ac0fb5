//! Bot matchmaking: the join race, the self-playing fleet, and admin knobs.

mod common;

use std::time::Duration;

use cardroom::bots::bot_user_id;
use cardroom::config::BotSeed;
use cardroom::engine::GameKind;
use cardroom::error::Error;
use cardroom::matches::model::{MatchStatus, SeatKind};
use cardroom::portal::Portal;

use common::{fast_config, filled_match, profile, wait_for};

fn bot_seed(name: &str, game: GameKind, mode: usize) -> BotSeed {
    BotSeed {
        name: name.to_string(),
        avatar: None,
        game,
        mode,
        ranked: None,
        policy: "random".to_string(),
        active: true,
    }
}

#[tokio::test]
async fn two_bots_race_for_the_last_seat() {
    let portal = Portal::builtin(fast_config());
    let runtime = portal.runtime().clone();

    // A 4p lobby with exactly one seat left.
    let m = portal
        .create_match(
            &profile("u0"),
            GameKind::SixtySix,
            4,
            Default::default(),
        )
        .await
        .unwrap();
    portal.join_match(&m.id, &profile("u1"), None).await.unwrap();
    portal.join_match(&m.id, &profile("u2"), None).await.unwrap();

    let ada = bot_user_id("Ada");
    let bruno = bot_user_id("Bruno");
    let (a, b) = tokio::join!(
        runtime.bot_join_match(&m.id, &ada),
        runtime.bot_join_match(&m.id, &bruno),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one bot takes the seat");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser.unwrap_err(), Error::Conflict(_)));

    let record = portal.get_match(&m.id).await.unwrap();
    assert_eq!(record.first_empty_seat(), None);
    let bot_seats = record
        .seats
        .iter()
        .filter(|s| s.kind == SeatKind::Bot)
        .count();
    assert_eq!(bot_seats, 1);
}

#[tokio::test]
async fn bot_fleet_plays_a_match_to_the_end() {
    let mut config = fast_config();
    config.bots = vec![
        bot_seed("Nora", GameKind::SixtySix, 4),
        bot_seed("Otto", GameKind::SixtySix, 4),
        bot_seed("Pia", GameKind::SixtySix, 4),
        bot_seed("Rudi", GameKind::SixtySix, 4),
    ];
    let portal = Portal::builtin(config);
    portal.spawn_background();

    wait_for(
        Duration::from_secs(30),
        "a bot-only match to finish",
        || async {
            let matches = portal.list_matches().await.unwrap();
            matches.iter().any(|m| {
                m.status == MatchStatus::Finished
                    && m.seats.iter().all(|s| s.kind == SeatKind::Bot)
            })
        },
    )
    .await;

    portal.shutdown().await;
}

#[tokio::test]
async fn forced_bot_fills_a_human_lobby() {
    let portal = Portal::builtin(fast_config());
    let m = portal
        .create_match(
            &profile("u0"),
            GameKind::SixtySix,
            2,
            Default::default(),
        )
        .await
        .unwrap();

    let hanna = bot_user_id("Hanna");
    portal.force_bot_to_lobby(&hanna, &m.id).await.unwrap();

    let record = portal.get_match(&m.id).await.unwrap();
    let seat = record.seat_of(&hanna).expect("bot seated");
    assert_eq!(seat.kind, SeatKind::Bot);
    assert!(seat.ready);

    // With the bot ready, the host can start at will.
    portal.set_ready(&m.id, &"u0".to_string(), true).await.unwrap();
    portal.start_game(&m.id, &"u0".to_string()).await.unwrap();
}

#[tokio::test]
async fn admin_knobs_toggle_matchmaking_and_bots() {
    let portal = Portal::builtin(fast_config());
    portal.spawn_background();

    let status = portal.status().await.unwrap();
    assert!(status.worker.matchmaking_enabled);

    portal.set_matchmaking_enabled(false).await;
    let status = portal.status().await.unwrap();
    assert!(!status.worker.matchmaking_enabled);

    let ada = bot_user_id("Ada");
    portal.set_bot_active(&ada, false).await.unwrap();
    let status = portal.status().await.unwrap();
    let ada_status = status
        .worker
        .bots
        .iter()
        .find(|b| b.user_id == ada)
        .expect("Ada in roster");
    assert!(!ada_status.active);

    let err = portal
        .set_bot_active(&"bot:Nobody".to_string(), true)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    portal.shutdown().await;
}

#[tokio::test]
async fn disabled_matchmaking_keeps_bots_idle() {
    let mut config = fast_config();
    config.matchmaking_enabled = false;
    config.bots = vec![
        bot_seed("Nora", GameKind::SixtySix, 2),
        bot_seed("Otto", GameKind::SixtySix, 2),
    ];
    let portal = Portal::builtin(config);
    portal.spawn_background();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(portal.list_matches().await.unwrap().is_empty());

    portal.shutdown().await;
}

#[tokio::test]
async fn bot_join_is_refused_once_the_table_is_in_game() {
    let portal = Portal::builtin(fast_config());
    let (id, users) = filled_match(&portal, GameKind::SixtySix, 2, false).await;
    portal.start_game(&id, &users[0]).await.unwrap();

    let ada = bot_user_id("Ada");
    let err = portal
        .runtime()
        .bot_join_match(&id, &ada)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}
