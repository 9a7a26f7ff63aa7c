//! SAFETY CRITICAL: volume window regression tests
//!
//! The entity maps 0..1 onto the configured dB window. Nothing the entity
//! sends may leave that window, whatever level or step is requested.

mod mock_servers;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use mock_servers::MockNadAmp;
use nadtcp2::entity::{NadEntity, VolumeRange};
use nadtcp2::nad::{ClientSettings, NadClient};

/// -80..-10 dB window, 4 dB step
fn window() -> VolumeRange {
    VolumeRange::new(-80, -10, 4)
}

/// Entity connected to `amp`, with the amplifier's initial report applied
async fn entity_for(amp: &MockNadAmp) -> NadEntity {
    let client = Arc::new(NadClient::new(
        "127.0.0.1",
        ClientSettings {
            port: amp.port(),
            ..ClientSettings::default()
        },
    ));
    let reader = client.connect().await.unwrap();
    {
        let client = client.clone();
        tokio::spawn(async move { client.read_loop(reader).await });
    }

    let keys = amp.key_count().await;
    let mut rx = client.subscribe();
    timeout(Duration::from_secs(2), rx.wait_for(|s| s.len() == keys))
        .await
        .expect("no state report")
        .unwrap();

    let entity = NadEntity::new("Amp", window(), client);
    entity
        .handle_state_changed(&entity.client().status().await)
        .await;
    entity
}

async fn last_command(amp: &MockNadAmp) -> String {
    timeout(Duration::from_secs(2), async {
        loop {
            let commands = amp.commands().await;
            if commands.len() > 1 {
                return commands[commands.len() - 1].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no command received")
}

// =============================================================================
// Pure mapping
// =============================================================================

#[test]
fn level_zero_is_window_minimum() {
    assert_eq!(window().internal_vol_to_nad_vol(0.0), -80.0);
}

#[test]
fn level_one_is_window_maximum_not_device_maximum() {
    // 0 dB is the amplifier's maximum; the window stops at -10
    assert_eq!(window().internal_vol_to_nad_vol(1.0), -10.0);
}

#[test]
fn levels_map_to_whole_db() {
    let w = window();
    for i in 0..=100 {
        let db = w.internal_vol_to_nad_vol(i as f64 / 100.0);
        assert_eq!(db.fract(), 0.0, "level {} gave {}", i, db);
        assert!((-80.0..=-10.0).contains(&db));
    }
}

#[test]
fn loud_device_reports_saturate() {
    let w = window();
    assert_eq!(w.nad_vol_to_internal_vol(Some(-2.0)), 1.0);
    assert_eq!(w.nad_vol_to_internal_vol(Some(-79.5)), 0.5 / 70.0);
    assert_eq!(w.nad_vol_to_internal_vol(Some(-85.0)), 0.0);
}

// =============================================================================
// Against the amplifier
// =============================================================================

#[tokio::test]
async fn set_level_above_one_is_clamped() {
    let amp = MockNadAmp::start().await;
    let entity = entity_for(&amp).await;

    entity.set_volume_level(1.5).await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-10.0");
}

#[tokio::test]
async fn set_negative_level_is_clamped() {
    let amp = MockNadAmp::start().await;
    let entity = entity_for(&amp).await;

    entity.set_volume_level(-0.3).await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-80.0");
}

#[tokio::test]
async fn volume_up_steps_half_the_configured_step() {
    let amp = MockNadAmp::start().await;
    let entity = entity_for(&amp).await;

    entity.volume_up().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-38.0");
}

#[tokio::test]
async fn volume_down_steps_half_the_configured_step() {
    let amp = MockNadAmp::start().await;
    let entity = entity_for(&amp).await;

    entity.volume_down().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-42.0");
}

#[tokio::test]
async fn volume_up_at_window_top_stays_at_top() {
    let amp = MockNadAmp::start().await;
    amp.set_value("Main.Volume", "-11").await;
    let entity = entity_for(&amp).await;

    entity.volume_up().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-10.0");
}

#[tokio::test]
async fn volume_above_window_is_pulled_into_window() {
    // Turned up on the front panel past the window
    let amp = MockNadAmp::start().await;
    amp.set_value("Main.Volume", "-3").await;
    let entity = entity_for(&amp).await;
    assert_eq!(entity.volume_level().await, Some(1.0));

    entity.volume_up().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-10.0");
}

#[tokio::test]
async fn volume_down_at_window_bottom_stays_at_bottom() {
    let amp = MockNadAmp::start().await;
    amp.set_value("Main.Volume", "-79").await;
    let entity = entity_for(&amp).await;

    entity.volume_down().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume=-80.0");
}

#[tokio::test]
async fn unknown_volume_uses_relative_step() {
    let mut state = mock_servers::nad::default_state();
    state.remove("Main.Volume");
    let amp = MockNadAmp::start_with(state).await;
    let entity = entity_for(&amp).await;
    assert_eq!(entity.volume_level().await, None);

    entity.volume_up().await.unwrap();
    assert_eq!(last_command(&amp).await, "Main.Volume+");
}
