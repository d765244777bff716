//! Soundscape peer demo: two peers sharing one session in-process.
//!
//! Alice draws zones and starts the transport; Bob joins late, walks
//! through the zones and changes the tempo.  Run with
//! `RUST_LOG=info` (or `debug`) to watch replication and drift checks.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use soundscape_collab::{LocalRelay, PeerSession, SessionConfig};
use soundscape_core::{Clock, GeoPoint, SystemClock, ZoneGeometry};
use soundscape_transport::ClockedEngine;
use soundscape_zones::{RecordingRenderer, SoundingSet};

const PARK: GeoPoint = GeoPoint::new(51.5033, -0.1196);

fn spawn_peer(name: &str, clock: Arc<dyn Clock>) -> (Arc<PeerSession>, RecordingRenderer) {
    let renderer = RecordingRenderer::new();
    let mut config = SessionConfig::default().with_name(name);
    config.transport = config
        .transport
        .with_corrector_interval(Duration::from_millis(300))
        .with_jitter_ratio(0.25);
    config.zones = config.zones.with_proximity_threshold(60.0);
    let session = PeerSession::new(
        config,
        clock.clone(),
        Box::new(renderer.clone()),
    );
    session.initialize(Box::new(ClockedEngine::new(clock)));
    session.start();
    (session, renderer)
}

fn report(name: &str, sounding: Option<SoundingSet>) {
    let Some(set) = sounding else {
        return;
    };
    if set.is_empty() {
        info!("{name}: silence");
    }
    for zone in &set.zones {
        info!(
            "{name}: {} playing '{}' at {:.0}%{}",
            zone.id,
            zone.sound_id,
            zone.volume * 100.0,
            if zone.inside { " (inside)" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let relay = Arc::new(LocalRelay::default());

    let (alice, _) = spawn_peer("Alice", clock.clone());
    if let Err(e) = alice.connect(relay.clone()) {
        warn!("Alice could not connect: {e}");
        return;
    }

    let zones = [
        (ZoneGeometry::Circle { center: PARK, radius_m: 40.0 }, "rain"),
        (
            ZoneGeometry::Rectangle {
                south_west: GeoPoint::new(PARK.lat + 0.0008, PARK.lng - 0.0005),
                north_east: GeoPoint::new(PARK.lat + 0.0012, PARK.lng + 0.0005),
            },
            "birdsong",
        ),
    ];
    for (geometry, sound) in zones {
        match alice.zones().create_zone(geometry, Some(sound.to_string())) {
            Ok(id) => info!("Alice drew {id} ({sound})"),
            Err(e) => warn!("Alice could not draw a zone: {e}"),
        }
    }
    alice.transport().play();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let (bob, bob_renderer) = spawn_peer("Bob", clock.clone());
    if let Err(e) = bob.connect(relay.clone()) {
        warn!("Bob could not connect: {e}");
        return;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "Bob sees {} zones ({} drawn), transport {:?}, position {:?}",
        bob.zones().zone_count(),
        bob_renderer.live_count(),
        bob.transport().state(),
        bob.transport().engine_position(),
    );

    // Walk north from the park centre through both zones.
    for step in 0..8 {
        let here = GeoPoint::new(PARK.lat + f64::from(step) * 0.0002, PARK.lng);
        report("Bob", bob.update_position(here));
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    // Alice rebinds a zone; Bob re-evaluates without moving.
    if let Some(zone) = alice.zones().zone_ids().first() {
        if let Err(e) = alice.zones().assign_sound(zone, Some("thunder".to_string())) {
            warn!("Alice could not reassign a sound: {e}");
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    report("Bob", bob.refresh_sounding());

    bob.transport().set_tempo(96.0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Alice transport after Bob's tempo change: {:?}", alice.transport().state());
    info!("Alice sees peers: {:?}", alice.visible_peers().iter().map(|u| u.name.clone()).collect::<Vec<_>>());

    bob.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Relay stats: {:?}", relay.stats());
    alice.shutdown();
}
