//! Scenario tests for the propagation engine.
//!
//! These exercise the documented boundary behaviors and reference numbers:
//! - Free-space figures at 10 m / 2.4 GHz
//! - Ordered fan-out across multiple receivers
//! - Frequency gating and threshold gating
//! - Position-update interaction with the fan-out

use std::collections::BTreeSet;

use bytes::Bytes;

use airwave::propagation::{PropagationEngine, TransmissionDescriptor};
use airwave::registry::DeviceRegistry;
use airwave::types::{dbm_to_watts, watts_to_dbm, DeviceId, Position};

const GHZ_2_4: u32 = 2_400_000_000;

fn transmission(transmitter: DeviceId, tx_power_dbm: f64, tx_timestamp: u64) -> TransmissionDescriptor {
    TransmissionDescriptor {
        transmitter,
        source_rank: 1,
        tx_power_w: dbm_to_watts(tx_power_dbm),
        frequency_hz: GHZ_2_4,
        payload: Bytes::from_static(b"frame"),
        tx_vector: Bytes::new(),
        tx_timestamp,
        sequence: 1,
    }
}

fn register(registry: &mut DeviceRegistry, rank: u32, node: u32, position: Position) -> DeviceId {
    registry.register(rank, node, 0, position, BTreeSet::new(), 0)
}

// ============================================================================
// Scenario: single receiver, free space
// ============================================================================

#[test]
fn test_single_receiver_free_space_reference_numbers() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    register(&mut registry, 2, 20, Position::new(10.0, 0.0, 0.0));

    let engine = PropagationEngine::new(1e-15);
    let receptions = engine
        .fan_out(&transmission(tx, 20.0, 0), &registry)
        .unwrap();

    assert_eq!(receptions.len(), 1);
    let r = &receptions[0];
    assert_eq!(r.distance_m, 10.0);
    // Nearest integer nanosecond of 10 m / c.
    assert_eq!(r.delay_ns, 33);
    // Free-space loss at 10 m / 2.4 GHz.
    assert!((r.path_loss_db - 60.05).abs() < 0.01, "loss {}", r.path_loss_db);
    assert!((r.rx_power_dbm - (20.0 - r.path_loss_db)).abs() < 1e-9);
    // The linear and logarithmic fields agree.
    assert!((watts_to_dbm(r.rx_power_w) - r.rx_power_dbm).abs() < 1e-9);
}

// ============================================================================
// Scenario: three receivers, ordered fan-out
// ============================================================================

#[test]
fn test_three_receivers_ordered_fan_out() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    register(&mut registry, 2, 20, Position::new(10.0, 0.0, 0.0));
    register(&mut registry, 2, 21, Position::new(20.0, 0.0, 0.0));
    register(&mut registry, 3, 30, Position::new(30.0, 0.0, 0.0));

    let engine = PropagationEngine::new(1e-15);
    let receptions = engine
        .fan_out(&transmission(tx, 16.0, 0), &registry)
        .unwrap();

    assert_eq!(receptions.len(), 3);
    assert_eq!(
        receptions.iter().map(|r| r.device_id).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );
    for pair in receptions.windows(2) {
        assert!(pair[0].distance_m < pair[1].distance_m);
        assert!(pair[0].delay_ns < pair[1].delay_ns);
        // Further receivers hear less power.
        assert!(pair[0].rx_power_dbm > pair[1].rx_power_dbm);
    }
}

// ============================================================================
// Scenario: frequency mismatch
// ============================================================================

#[test]
fn test_frequency_mismatch_suppresses_reception() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    registry.register(
        2,
        20,
        0,
        Position::new(10.0, 0.0, 0.0),
        [2_462_000_000u32].into_iter().collect(),
        0,
    );

    let engine = PropagationEngine::new(1e-15);
    let receptions = engine
        .fan_out(&transmission(tx, 20.0, 0), &registry)
        .unwrap();
    assert!(receptions.is_empty());
}

// ============================================================================
// Scenario: position update determinism
// ============================================================================

#[test]
fn test_position_update_then_transmit() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    let rx = register(&mut registry, 2, 20, Position::new(0.0, 0.0, 0.0));

    // The update precedes the transmission in simulation time.
    assert!(registry.update_position(rx, Position::new(100.0, 0.0, 0.0), 500));

    let engine = PropagationEngine::new(1e-15);
    let receptions = engine
        .fan_out(&transmission(tx, 20.0, 1_000), &registry)
        .unwrap();

    assert_eq!(receptions.len(), 1);
    assert_eq!(receptions[0].distance_m, 100.0);
    assert_eq!(receptions[0].delay_ns, 334); // 100 m / c, rounded
    assert_eq!(receptions[0].reception_timestamp, 1_334);
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn test_fan_out_completeness_against_threshold() {
    // Every frequency-compatible device above threshold appears exactly
    // once; every device below threshold never appears.
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    for node in 0..20u32 {
        register(
            &mut registry,
            2,
            100 + node,
            Position::new(10.0 + 50.0 * node as f64, 0.0, 0.0),
        );
    }

    let threshold = 1e-10; // -70 dBm

    let engine = PropagationEngine::new(threshold);
    let receptions = engine
        .fan_out(&transmission(tx, 20.0, 0), &registry)
        .unwrap();

    // Compare against an ungated fan-out of the same transmission.
    let ungated = PropagationEngine::new(0.0)
        .fan_out(&transmission(tx, 20.0, 0), &registry)
        .unwrap();
    let received: Vec<DeviceId> = receptions.iter().map(|r| r.device_id).collect();
    let expected: Vec<DeviceId> = ungated
        .iter()
        .filter(|r| r.rx_power_w >= threshold)
        .map(|r| r.device_id)
        .collect();
    assert_eq!(received, expected);
    assert!(!received.is_empty());
    assert!(received.len() < 20, "threshold must exclude the far tail");

    for r in &receptions {
        assert!(r.rx_power_w >= threshold);
        assert_eq!(r.reception_timestamp, r.delay_ns); // tx_timestamp == 0
    }
}

#[test]
fn test_reception_timestamp_arithmetic_is_exact() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(0.0, 0.0, 0.0));
    register(&mut registry, 2, 20, Position::new(299.792458, 0.0, 0.0));

    let engine = PropagationEngine::new(1e-18);
    // 299.792458 m is exactly 1000 ns at c.
    let receptions = engine
        .fan_out(&transmission(tx, 20.0, 123_456), &registry)
        .unwrap();
    assert_eq!(receptions[0].delay_ns, 1_000);
    assert_eq!(receptions[0].reception_timestamp, 124_456);
}

#[test]
fn test_repeated_fan_out_bitwise_stable() {
    let mut registry = DeviceRegistry::new();
    let tx = register(&mut registry, 1, 10, Position::new(1.0, 2.0, 3.0));
    for node in 0..8u32 {
        register(
            &mut registry,
            2,
            50 + node,
            Position::new(-7.5 * node as f64, 13.25, node as f64),
        );
    }

    let engine = PropagationEngine::new(1e-16);
    let tx_desc = transmission(tx, 17.5, 42);
    let a = engine.fan_out(&tx_desc, &registry).unwrap();
    let b = engine.fan_out(&tx_desc, &registry).unwrap();

    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.device_id, y.device_id);
        assert_eq!(x.rx_power_w.to_bits(), y.rx_power_w.to_bits());
        assert_eq!(x.rx_power_dbm.to_bits(), y.rx_power_dbm.to_bits());
        assert_eq!(x.path_loss_db.to_bits(), y.path_loss_db.to_bits());
        assert_eq!(x.distance_m.to_bits(), y.distance_m.to_bits());
        assert_eq!(x.delay_ns, y.delay_ns);
        assert_eq!(x.reception_timestamp, y.reception_timestamp);
    }
}
