//! Propagation engine: the pure function mapping a transmission and a
//! registry snapshot to a set of receptions.
//!
//! Loss and delay models are consumed through trait seams so that model
//! configuration can travel on the wire as an opaque parameter blob. The
//! built-in defaults are free-space path loss and constant-speed delay.
//!
//! Given identical registry state, transmission descriptor, and model
//! configuration, the engine emits reception descriptors in the same order
//! (ascending receiver device id) with bitwise-stable numeric fields.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{ChannelError, ChannelResult};
use crate::registry::DeviceRegistry;
use crate::types::{
    dbm_to_watts, light_delay_ns, watts_to_dbm, DeviceId, PhyId, Position, Rank, SequenceNumber,
    SimTime, SPEED_OF_LIGHT_M_PER_S,
};

/// Propagation loss model seam.
///
/// Implementations return the received power in dBm at `rx_pos` for a
/// transmission of `tx_power_dbm` from `tx_pos` at `frequency_hz`.
pub trait PropagationLossModel: Send {
    fn evaluate(
        &self,
        tx_pos: Position,
        rx_pos: Position,
        tx_power_dbm: f64,
        frequency_hz: u32,
    ) -> f64;
}

/// Propagation delay model seam. Returns integer nanoseconds.
pub trait PropagationDelayModel: Send {
    fn evaluate(&self, tx_pos: Position, rx_pos: Position) -> SimTime;
}

/// Free-space path loss: `L_dB = 20·log10(4πdf/c)`.
///
/// Co-located transmitter and receiver see zero loss.
///
/// # Example
/// ```
/// use airwave::propagation::{FreeSpaceLoss, PropagationLossModel};
/// use airwave::types::Position;
///
/// let model = FreeSpaceLoss;
/// let rx = model.evaluate(
///     Position::new(0.0, 0.0, 0.0),
///     Position::new(10.0, 0.0, 0.0),
///     20.0,
///     2_400_000_000,
/// );
/// // 20 dBm across 10 m at 2.4 GHz: about -40.05 dBm.
/// assert!((rx + 40.05).abs() < 0.01);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct FreeSpaceLoss;

impl PropagationLossModel for FreeSpaceLoss {
    fn evaluate(
        &self,
        tx_pos: Position,
        rx_pos: Position,
        tx_power_dbm: f64,
        frequency_hz: u32,
    ) -> f64 {
        let distance = tx_pos.distance_to(&rx_pos);
        if distance == 0.0 {
            return tx_power_dbm;
        }
        let path_loss_db = 20.0
            * (4.0 * std::f64::consts::PI * distance * frequency_hz as f64
                / SPEED_OF_LIGHT_M_PER_S)
                .log10();
        tx_power_dbm - path_loss_db
    }
}

/// Log-distance path loss with a 1 m reference distance:
/// `PL(d) = PL(d0) + 10·n·log10(d)`.
///
/// Distances under the reference distance see the reference loss. No
/// shadowing term: the engine must stay deterministic.
#[derive(Clone, Copy, Debug)]
pub struct LogDistanceLoss {
    /// Path loss exponent `n` (2.0 = free space, higher indoors).
    pub exponent: f64,
    /// Loss at the 1 m reference distance, in dB.
    pub reference_loss_db: f64,
}

impl PropagationLossModel for LogDistanceLoss {
    fn evaluate(
        &self,
        tx_pos: Position,
        rx_pos: Position,
        tx_power_dbm: f64,
        _frequency_hz: u32,
    ) -> f64 {
        let distance = tx_pos.distance_to(&rx_pos);
        let path_loss_db = if distance < 1.0 {
            self.reference_loss_db
        } else {
            self.reference_loss_db + 10.0 * self.exponent * distance.log10()
        };
        tx_power_dbm - path_loss_db
    }
}

/// Constant-speed delay: `distance / c`, rounded to integer nanoseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantSpeedDelay;

impl PropagationDelayModel for ConstantSpeedDelay {
    fn evaluate(&self, tx_pos: Position, rx_pos: Position) -> SimTime {
        light_delay_ns(tx_pos.distance_to(&rx_pos))
    }
}

/// Fixed delay regardless of distance.
#[derive(Clone, Copy, Debug)]
pub struct FixedDelay {
    pub delay_ns: SimTime,
}

impl PropagationDelayModel for FixedDelay {
    fn evaluate(&self, _tx_pos: Position, _rx_pos: Position) -> SimTime {
        self.delay_ns
    }
}

/// Ephemeral description of one transmission, built from a `TX_REQUEST`.
#[derive(Clone, Debug)]
pub struct TransmissionDescriptor {
    pub transmitter: DeviceId,
    pub source_rank: Rank,
    /// Transmit power in linear watts.
    pub tx_power_w: f64,
    pub frequency_hz: u32,
    pub payload: Bytes,
    pub tx_vector: Bytes,
    /// Simulation time the transmission started.
    pub tx_timestamp: SimTime,
    pub sequence: SequenceNumber,
}

/// One candidate reception produced by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceptionDescriptor {
    pub device_id: DeviceId,
    pub owning_rank: Rank,
    pub phy_id: PhyId,
    pub rx_power_w: f64,
    pub rx_power_dbm: f64,
    pub path_loss_db: f64,
    pub distance_m: f64,
    pub delay_ns: SimTime,
    /// `tx_timestamp + delay_ns`, exact in integer nanoseconds.
    pub reception_timestamp: SimTime,
}

/// The propagation engine.
///
/// Owns the configured loss and delay models and the reception threshold.
/// `fan_out` is a pure function of its inputs and the configuration.
pub struct PropagationEngine {
    loss: Box<dyn PropagationLossModel>,
    delay: Box<dyn PropagationDelayModel>,
    reception_threshold_w: f64,
}

impl PropagationEngine {
    /// Creates an engine with the default models and the given linear-power
    /// reception floor.
    pub fn new(reception_threshold_w: f64) -> Self {
        Self {
            loss: Box::new(FreeSpaceLoss),
            delay: Box::new(ConstantSpeedDelay),
            reception_threshold_w,
        }
    }

    /// Replaces the loss model.
    pub fn set_loss_model(&mut self, model: Box<dyn PropagationLossModel>) {
        self.loss = model;
    }

    /// Replaces the delay model.
    pub fn set_delay_model(&mut self, model: Box<dyn PropagationDelayModel>) {
        self.delay = model;
    }

    /// The configured linear-power floor below which receivers are skipped.
    pub fn reception_threshold_w(&self) -> f64 {
        self.reception_threshold_w
    }

    /// Computes the set of candidate receptions for one transmission.
    ///
    /// Receivers are visited in ascending device-id order. A receiver is
    /// skipped when it is the transmitter itself, when its frequency set
    /// excludes the transmission frequency, when its distance is not
    /// representable, or when the received power falls below the threshold.
    ///
    /// Returns `UnknownDevice` if the transmitter has no registry record;
    /// a transmission with non-positive power is a no-op and yields no
    /// receptions.
    pub fn fan_out(
        &self,
        tx: &TransmissionDescriptor,
        registry: &DeviceRegistry,
    ) -> ChannelResult<Vec<ReceptionDescriptor>> {
        let transmitter = registry
            .get(tx.transmitter)
            .ok_or(ChannelError::UnknownDevice(tx.transmitter))?;
        let tx_pos = transmitter.position;

        if tx.tx_power_w <= 0.0 {
            warn!(
                transmitter = tx.transmitter,
                tx_power_w = tx.tx_power_w,
                "dropping transmission with non-positive power"
            );
            return Ok(Vec::new());
        }
        let tx_power_dbm = watts_to_dbm(tx.tx_power_w);

        let mut receptions = Vec::new();
        for receiver in registry.snapshot_all() {
            if receiver.device_id == tx.transmitter {
                continue;
            }
            if !receiver.supports_frequency(tx.frequency_hz) {
                debug!(
                    receiver = receiver.device_id,
                    frequency_hz = tx.frequency_hz,
                    "skipped frequency-incompatible receiver"
                );
                continue;
            }

            let distance_m = tx_pos.distance_to(&receiver.position);
            if !distance_m.is_finite() {
                warn!(
                    transmitter = tx.transmitter,
                    receiver = receiver.device_id,
                    "skipped receiver at non-representable distance"
                );
                continue;
            }

            let rx_power_dbm = self
                .loss
                .evaluate(tx_pos, receiver.position, tx_power_dbm, tx.frequency_hz)
                + receiver.antenna_gain_db;
            if !rx_power_dbm.is_finite() {
                warn!(
                    receiver = receiver.device_id,
                    "loss model produced a non-finite power; receiver skipped"
                );
                continue;
            }
            let rx_power_w = dbm_to_watts(rx_power_dbm);
            if rx_power_w < self.reception_threshold_w {
                continue;
            }

            let delay_ns = self.delay.evaluate(tx_pos, receiver.position);
            receptions.push(ReceptionDescriptor {
                device_id: receiver.device_id,
                owning_rank: receiver.owning_rank,
                phy_id: receiver.phy_id,
                rx_power_w,
                rx_power_dbm,
                path_loss_db: tx_power_dbm - rx_power_dbm,
                distance_m,
                delay_ns,
                reception_timestamp: tx.tx_timestamp + delay_ns,
            });
        }
        Ok(receptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn descriptor(transmitter: DeviceId, tx_power_dbm: f64, frequency_hz: u32) -> TransmissionDescriptor {
        TransmissionDescriptor {
            transmitter,
            source_rank: 1,
            tx_power_w: dbm_to_watts(tx_power_dbm),
            frequency_hz,
            payload: Bytes::from_static(b"frame"),
            tx_vector: Bytes::new(),
            tx_timestamp: 1_000,
            sequence: 1,
        }
    }

    fn register_at(registry: &mut DeviceRegistry, rank: Rank, node: u32, x: f64) -> DeviceId {
        registry.register(
            rank,
            node,
            0,
            Position::new(x, 0.0, 0.0),
            BTreeSet::new(),
            0,
        )
    }

    #[test]
    fn test_free_space_reference_values() {
        let model = FreeSpaceLoss;
        let origin = Position::new(0.0, 0.0, 0.0);
        let ten_m = Position::new(10.0, 0.0, 0.0);

        // 10 m at 2.4 GHz: path loss about 60.05 dB.
        let rx = model.evaluate(origin, ten_m, 20.0, 2_400_000_000);
        assert!((20.0 - rx - 60.05).abs() < 0.01, "loss was {}", 20.0 - rx);

        // Same position: no loss.
        assert_eq!(model.evaluate(origin, origin, 20.0, 2_400_000_000), 20.0);
    }

    #[test]
    fn test_log_distance_loss() {
        let model = LogDistanceLoss {
            exponent: 2.0,
            reference_loss_db: 40.0,
        };
        let origin = Position::new(0.0, 0.0, 0.0);

        // At 1 m, exactly the reference loss.
        let rx = model.evaluate(origin, Position::new(1.0, 0.0, 0.0), 10.0, 0);
        assert!((rx - (10.0 - 40.0)).abs() < 1e-12);

        // At 100 m with n=2: 40 + 10*2*2 = 80 dB.
        let rx = model.evaluate(origin, Position::new(100.0, 0.0, 0.0), 10.0, 0);
        assert!((rx - (10.0 - 80.0)).abs() < 1e-12);

        // Under the reference distance the loss is clamped.
        let rx = model.evaluate(origin, Position::new(0.2, 0.0, 0.0), 10.0, 0);
        assert!((rx - (10.0 - 40.0)).abs() < 1e-12);
    }

    #[test]
    fn test_delay_models() {
        let origin = Position::new(0.0, 0.0, 0.0);
        let ten_m = Position::new(10.0, 0.0, 0.0);
        assert_eq!(ConstantSpeedDelay.evaluate(origin, ten_m), 33);
        assert_eq!(ConstantSpeedDelay.evaluate(origin, origin), 0);
        assert_eq!(FixedDelay { delay_ns: 500 }.evaluate(origin, ten_m), 500);
    }

    #[test]
    fn test_single_receiver_free_space() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        let rx = register_at(&mut registry, 2, 20, 10.0);

        let engine = PropagationEngine::new(1e-15);
        let receptions = engine
            .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
            .unwrap();

        assert_eq!(receptions.len(), 1);
        let r = &receptions[0];
        assert_eq!(r.device_id, rx);
        assert_eq!(r.owning_rank, 2);
        assert_eq!(r.distance_m, 10.0);
        assert_eq!(r.delay_ns, 33);
        assert_eq!(r.reception_timestamp, 1_033);
        assert!((r.path_loss_db - 60.05).abs() < 0.01);
        assert!((r.rx_power_dbm - (20.0 - r.path_loss_db)).abs() < 1e-9);
    }

    #[test]
    fn test_fan_out_order_and_monotone_distance() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        register_at(&mut registry, 2, 20, 10.0);
        register_at(&mut registry, 2, 21, 20.0);
        register_at(&mut registry, 3, 30, 30.0);

        let engine = PropagationEngine::new(1e-15);
        let receptions = engine
            .fan_out(&descriptor(tx, 16.0, 2_400_000_000), &registry)
            .unwrap();

        assert_eq!(receptions.len(), 3);
        let ids: Vec<DeviceId> = receptions.iter().map(|r| r.device_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        for pair in receptions.windows(2) {
            assert!(pair[0].distance_m < pair[1].distance_m);
            assert!(pair[0].delay_ns < pair[1].delay_ns);
        }
    }

    #[test]
    fn test_same_position_receiver() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        register_at(&mut registry, 2, 20, 0.0);

        let engine = PropagationEngine::new(1e-15);
        let receptions = engine
            .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
            .unwrap();

        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].rx_power_dbm, 20.0);
        assert_eq!(receptions[0].path_loss_db, 0.0);
        assert_eq!(receptions[0].delay_ns, 0);
        assert_eq!(receptions[0].reception_timestamp, 1_000);
    }

    #[test]
    fn test_frequency_mismatch_yields_nothing() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
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
            .fan_out(&descriptor(tx, 20.0, 2_412_000_000), &registry)
            .unwrap();
        assert!(receptions.is_empty());
    }

    #[test]
    fn test_single_device_registry() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);

        let engine = PropagationEngine::new(1e-15);
        let receptions = engine
            .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
            .unwrap();
        assert!(receptions.is_empty());
    }

    #[test]
    fn test_unknown_transmitter() {
        let registry = DeviceRegistry::new();
        let engine = PropagationEngine::new(1e-15);
        let result = engine.fan_out(&descriptor(9, 20.0, 2_400_000_000), &registry);
        assert!(matches!(result, Err(ChannelError::UnknownDevice(9))));
    }

    #[test]
    fn test_non_positive_power_is_no_op() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        register_at(&mut registry, 2, 20, 10.0);

        let engine = PropagationEngine::new(1e-15);
        let mut tx_desc = descriptor(tx, 20.0, 2_400_000_000);
        tx_desc.tx_power_w = 0.0;
        assert!(engine.fan_out(&tx_desc, &registry).unwrap().is_empty());
        tx_desc.tx_power_w = -1.0;
        assert!(engine.fan_out(&tx_desc, &registry).unwrap().is_empty());
    }

    #[test]
    fn test_reception_threshold_gate() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        register_at(&mut registry, 2, 20, 10.0);

        // 20 dBm across 10 m at 2.4 GHz arrives near -40 dBm (1e-7 W).
        let permissive = PropagationEngine::new(1e-9);
        assert_eq!(
            permissive
                .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
                .unwrap()
                .len(),
            1
        );

        let strict = PropagationEngine::new(1e-5);
        assert!(strict
            .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_overflowing_distance_skipped() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        registry.register(
            2,
            20,
            0,
            Position::new(f64::MAX, f64::MAX, 0.0),
            BTreeSet::new(),
            0,
        );
        register_at(&mut registry, 3, 30, 10.0);

        let engine = PropagationEngine::new(1e-15);
        let receptions = engine
            .fan_out(&descriptor(tx, 20.0, 2_400_000_000), &registry)
            .unwrap();
        // The unrepresentable receiver is skipped, the sane one survives.
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].device_id, 3);
    }

    #[test]
    fn test_fan_out_is_deterministic() {
        let mut registry = DeviceRegistry::new();
        let tx = register_at(&mut registry, 1, 10, 0.0);
        for node in 20..30 {
            register_at(&mut registry, 2, node, 3.7 * (node - 19) as f64);
        }

        let engine = PropagationEngine::new(1e-15);
        let tx_desc = descriptor(tx, 16.0, 2_400_000_000);
        let first = engine.fan_out(&tx_desc, &registry).unwrap();
        let second = engine.fan_out(&tx_desc, &registry).unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.device_id, b.device_id);
            assert_eq!(a.rx_power_w.to_bits(), b.rx_power_w.to_bits());
            assert_eq!(a.rx_power_dbm.to_bits(), b.rx_power_dbm.to_bits());
            assert_eq!(a.path_loss_db.to_bits(), b.path_loss_db.to_bits());
            assert_eq!(a.distance_m.to_bits(), b.distance_m.to_bits());
            assert_eq!(a.delay_ns, b.delay_ns);
        }
    }
}
