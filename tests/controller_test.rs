//! Controller Session Integration Test
//!
//! Verifies the full session behavior of [`Cryocon22c`] over a scripted
//! transport:
//! - Connect discovers the topology and locks the keypad; disconnect
//!   releases it
//! - Reads always hit the wire; nothing but topology is cached
//! - Validation failures (out-of-range set point, unknown channel or
//!   loop) are rejected before any command is sent
//! - State-changing commands are confirmed by read-back, and a
//!   disagreeing instrument surfaces as an error

use anyhow::Result;
use cryocon_22c::{
    Cryocon22c, CryoconError, HeaterRange, InstrumentTransport, MockTransport,
};

/// Queue the wire exchange for a full `connect`: two configured loops
/// (1 -> channel a, 2 -> channel b), then the keypad lock and its
/// confirmation read.
async fn script_connect(mock: &MockTransport) {
    mock.push_response("CHA").await;
    mock.push_response("475.000K").await;
    mock.push_response("CHB").await;
    mock.push_response("350.000K").await;
    mock.push_response("NONE").await;
    mock.push_response("Cold Finger").await;
    mock.push_response("K").await;
    mock.push_response("Radiation Shield").await;
    mock.push_response("K").await;
    mock.push_response("").await; // ack for system:lock on
    mock.push_response("on").await;
}

async fn connected_controller() -> (Cryocon22c<MockTransport>, MockTransport) {
    let mock = MockTransport::new();
    script_connect(&mock).await;
    let controller = Cryocon22c::new(mock.clone());
    controller.connect().await.unwrap();
    mock.clear_commands().await;
    (controller, mock)
}

#[tokio::test]
async fn test_full_session_lifecycle() -> Result<()> {
    let mock = MockTransport::new();
    let controller = Cryocon22c::new(mock.clone());

    // 1. Connect: discovery plus keypad lock
    script_connect(&mock).await;
    controller.connect().await?;
    assert!(controller.is_connected().await);

    // 2. Read a temperature
    mock.push_response("295.372K").await;
    let temp = controller.temperature('a').await?;
    assert!((temp - 295.372).abs() < 1e-9);

    // 3. Change a set point, confirmed by read-back
    mock.push_response("").await; // ack
    mock.push_response("77.350K").await; // read-back agrees
    controller.set_temperature('a', 77.35).await?;

    // 4. Engage and stop control, each confirmed
    mock.push_response("").await;
    mock.push_response("on").await;
    controller.enable().await?;

    mock.push_response("").await;
    mock.push_response("off").await;
    controller.disable().await?;

    // 5. Disconnect releases the keypad
    mock.push_response("").await; // ack for system:lock off
    mock.push_response("off").await;
    controller.disconnect().await?;
    assert!(!controller.is_connected().await);

    // 6. The whole exchange ran in lock-step: every scripted response was
    //    consumed by exactly the command it was queued for.
    assert_eq!(mock.remaining_responses().await, 0);
    let commands = mock.commands().await;
    assert_eq!(commands[0], "loop 1:source?");
    assert_eq!(commands[9], "system:lock on");
    assert_eq!(commands[11], "input? a");
    assert_eq!(commands[12], "loop 1:setpt 77.350");
    assert_eq!(commands[13], "loop 1:setpt?");
    assert_eq!(commands[14], "control");
    assert_eq!(commands[16], "stop");
    assert_eq!(commands[18], "system:lock off");
    assert_eq!(commands.len(), 20);

    Ok(())
}

#[tokio::test]
async fn test_topology_and_aliases_are_consistent() -> Result<()> {
    let (controller, _mock) = connected_controller().await;

    // Every channel maps to a loop whose source names it back
    let channels = controller.channels().await?;
    let loops = controller.loops().await?;
    assert_eq!(channels.len(), 2);
    assert_eq!(loops.len(), 2);
    for channel in &channels {
        let owner = loops.iter().find(|l| l.id == channel.loop_id).unwrap();
        assert_eq!(owner.source, format!("ch{}", channel.id));
    }

    // Letters, canonical tokens, and user names all resolve
    assert_eq!(controller.resolve_name("a").await?, 'a');
    assert_eq!(controller.resolve_name("CHB").await?, 'b');
    assert_eq!(controller.resolve_name("cold finger").await?, 'a');
    assert_eq!(controller.resolve_name("Radiation Shield").await?, 'b');

    // Topology is served from the registry, not the wire
    assert_eq!(controller.max_setpoint('a').await?, 475.0);
    assert_eq!(controller.max_setpoint('b').await?, 350.0);
    assert_eq!(controller.channel_info('B').await?.unit, "K");

    Ok(())
}

#[tokio::test]
async fn test_validation_failures_send_nothing() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    // Set point above the loop 1 maximum of 475 K
    assert!(matches!(
        controller.set_temperature('a', 500.0).await,
        Err(CryoconError::SetPointOutOfRange {
            loop_id: 1,
            ..
        })
    ));

    // Unknown channel and unknown loop
    assert!(matches!(
        controller.temperature('x').await,
        Err(CryoconError::UnknownChannel(_))
    ));
    assert!(matches!(
        controller.set_range(3, HeaterRange::Low).await,
        Err(CryoconError::UnknownLoop(3))
    ));

    // Bad range token from caller input never builds a command at all
    assert!(matches!(
        "max".parse::<HeaterRange>(),
        Err(CryoconError::InvalidRange(_))
    ));

    // None of the rejected requests reached the wire
    assert!(mock.commands().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_reads_are_never_cached() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    mock.push_response("80.000K").await;
    mock.push_response("79.500K").await;
    assert!((controller.temperature('a').await? - 80.0).abs() < 1e-9);
    assert!((controller.temperature('a').await? - 79.5).abs() < 1e-9);

    // Both reads went to the instrument
    assert_eq!(
        mock.commands().await,
        vec!["input? a".to_string(), "input? a".to_string()]
    );

    Ok(())
}

#[tokio::test]
async fn test_clamped_set_point_fails_verification() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    // The instrument silently clamps 400.0 to 350.0 on loop 2
    mock.push_response("").await;
    mock.push_response("350.000K").await;
    let err = controller.set_temperature('b', 340.0).await.err();

    // 340 is within range, so the write happens; scripted read-back
    // disagrees, which must surface as a verification error.
    assert!(matches!(
        err,
        Some(CryoconError::WriteVerification { .. })
    ));
    assert_eq!(
        mock.commands().await,
        vec![
            "loop 2:setpt 340.000".to_string(),
            "loop 2:setpt?".to_string()
        ]
    );

    Ok(())
}

#[tokio::test]
async fn test_setting_the_same_value_twice_is_idempotent() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    for _ in 0..2 {
        mock.push_response("").await;
        mock.push_response("77.350K").await;
        controller.set_temperature('a', 77.35).await?;
    }

    // Each call is a full write-then-verify cycle
    let commands = mock.commands().await;
    assert_eq!(commands.len(), 4);
    assert_eq!(commands[0], "loop 1:setpt 77.350");
    assert_eq!(commands[2], "loop 1:setpt 77.350");

    Ok(())
}

#[tokio::test]
async fn test_faulted_sensor_reading_is_a_protocol_error() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    // The 22C reports dots for an open sensor
    mock.push_response(".......").await;
    assert!(matches!(
        controller.temperature('a').await,
        Err(CryoconError::Protocol(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_disconnect_proceeds_when_unlock_fails() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    // The instrument stops answering; the port must close anyway.
    mock.push_error(CryoconError::CommunicationTimeout(
        std::time::Duration::from_secs(10),
    ))
    .await;

    controller.disconnect().await?;
    assert!(!controller.is_connected().await);
    assert!(!mock.is_connected().await);

    Ok(())
}

#[tokio::test]
async fn test_enable_without_effect_is_reported() -> Result<()> {
    let (controller, mock) = connected_controller().await;

    mock.push_response("").await; // ack for control
    mock.push_response("off").await; // but the loops stayed off

    assert!(matches!(
        controller.enable().await,
        Err(CryoconError::CommandNotApplied { .. })
    ));

    Ok(())
}
