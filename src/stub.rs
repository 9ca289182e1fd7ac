//! The channel stub: the device-rank stand-in for the real channel object.
//!
//! Radios attach to the stub exactly as they would to an in-process channel;
//! the stub translates every operation into messages toward the channel
//! rank and delivers reception notifications back into the local radios.
//!
//! Inbound receptions are queued by reception timestamp and handed to radios
//! from [`ChannelStub::advance_to`], driven by the local simulator on every
//! time advance. A reception behind the current time is a causal violation
//! and fatal.
//!
//! In fallback mode (no fabric, single-process runs and unit tests) the stub
//! owns a private registry and propagation engine and runs the same fan-out
//! code the channel processor uses, with the same canonical picowatt power
//! encoding, so results are numerically identical to distributed mode.

use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigResult, CoreConfig};
use crate::error::{ChannelError, ChannelResult};
use crate::fabric::{tag_for, Fabric};
use crate::models::ModelCatalog;
use crate::propagation::{PropagationEngine, TransmissionDescriptor};
use crate::radio::{Radio, RadioHandle, Reception};
use crate::registry::{channel_center_frequency_hz, DeviceRegistry};
use crate::stats::RunSummary;
use crate::types::{
    picowatts_to_watts, watts_to_picowatts, DeviceId, Position, Rank, SequenceNumber, SimTime,
};
use crate::wire::{
    Body, ConfigBody, ConfigTarget, Header, Message, MessageType, PositionUpdateBody,
    RxNotificationBody, TxRequestBody, HEADER_VERSION,
};

/// An attach operation waiting for its acknowledgement.
struct PendingRegistration {
    radio: Weak<std::cell::RefCell<dyn Radio>>,
    position: Position,
    resolved: Option<DeviceId>,
}

/// In-process substitute for the channel rank, used in fallback mode.
struct FallbackChannel {
    registry: DeviceRegistry,
    engine: PropagationEngine,
    catalog: ModelCatalog,
}

/// The per-device-process channel stand-in.
///
/// At most one stub exists per logical channel on each device rank.
pub struct ChannelStub {
    local_rank: Rank,
    channel_rank: Rank,
    config: CoreConfig,
    /// Weak references only: the radio owns the stub, not the reverse.
    radios: BTreeMap<DeviceId, Weak<std::cell::RefCell<dyn Radio>>>,
    pending_registrations: HashMap<SequenceNumber, PendingRegistration>,
    /// Last emitted sequence per message type toward the channel rank.
    outbound_seq: HashMap<MessageType, SequenceNumber>,
    /// Last accepted sequence per (source rank, message type).
    inbound_seq: HashMap<(Rank, MessageType), SequenceNumber>,
    /// Position carried by the last POSITION_UPDATE actually sent.
    last_sent_position: HashMap<DeviceId, Position>,
    /// Receptions awaiting delivery, keyed by reception timestamp.
    pending_rx: BTreeMap<SimTime, Vec<(DeviceId, Reception)>>,
    configured_loss: Option<u32>,
    configured_delay: Option<u32>,
    summary: RunSummary,
    fallback: Option<FallbackChannel>,
    shutting_down: bool,
}

impl ChannelStub {
    /// Creates a stub for a device rank talking to the channel rank over a
    /// fabric. Fails fast if this process is the channel rank.
    pub fn new(config: CoreConfig, local_rank: Rank) -> ConfigResult<Self> {
        config.validate()?;
        if local_rank == config.channel_rank {
            return Err(ConfigError::Validation(format!(
                "channel stub cannot run on the channel rank {local_rank}"
            )));
        }
        let channel_rank = config.channel_rank;
        info!(local_rank, channel_rank, "channel stub initialized");
        Ok(Self::build(config, local_rank, channel_rank, None))
    }

    /// Creates a stub in fallback mode: no fabric, the propagation engine
    /// runs in-process against a private registry.
    pub fn fallback(config: CoreConfig) -> ConfigResult<Self> {
        config.validate()?;
        let fallback = FallbackChannel {
            registry: DeviceRegistry::new(),
            engine: PropagationEngine::new(config.reception_threshold_w),
            catalog: ModelCatalog::with_defaults(),
        };
        info!("channel stub initialized in fallback mode");
        Ok(Self::build(config.clone(), 1, config.channel_rank, Some(fallback)))
    }

    fn build(
        config: CoreConfig,
        local_rank: Rank,
        channel_rank: Rank,
        fallback: Option<FallbackChannel>,
    ) -> Self {
        Self {
            local_rank,
            channel_rank,
            config,
            radios: BTreeMap::new(),
            pending_registrations: HashMap::new(),
            outbound_seq: HashMap::new(),
            inbound_seq: HashMap::new(),
            last_sent_position: HashMap::new(),
            pending_rx: BTreeMap::new(),
            configured_loss: None,
            configured_delay: None,
            summary: RunSummary::new(),
            fallback,
            shutting_down: false,
        }
    }

    /// This stub's rank.
    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    /// True if this stub serves everything in-process.
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Number of radios currently mapped to device ids.
    pub fn radio_count(&self) -> usize {
        self.radios.len()
    }

    /// Receptions queued but not yet delivered.
    pub fn pending_reception_count(&self) -> usize {
        self.pending_rx.values().map(Vec::len).sum()
    }

    /// Type hash of the loss model most recently configured through this
    /// stub, if any.
    pub fn configured_loss_model(&self) -> Option<u32> {
        self.configured_loss
    }

    /// Type hash of the delay model most recently configured through this
    /// stub, if any.
    pub fn configured_delay_model(&self) -> Option<u32> {
        self.configured_delay
    }

    /// The run summary so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// The device id a previously attached radio was assigned.
    ///
    /// Compares allocation addresses, so any clone of the handle passed to
    /// `attach` resolves to the same id.
    pub fn device_id_of(&self, radio: &RadioHandle) -> Option<DeviceId> {
        let target = Rc::as_ptr(radio) as *const ();
        self.radios
            .iter()
            .find(|(_, weak)| weak.as_ptr() as *const () == target)
            .map(|(&id, _)| id)
    }

    // ── Attach ───────────────────────────────────────────────────────────────

    /// Attaches a radio, blocking until the channel rank acknowledges the
    /// registration or the wall-clock timeout expires.
    ///
    /// Registration is mandatory for correctness; a timeout fails the attach
    /// loudly and the caller decides whether to retry or abort the run.
    pub fn attach<F: Fabric>(
        &mut self,
        fabric: &mut F,
        radio: &RadioHandle,
        now: SimTime,
    ) -> ChannelResult<DeviceId> {
        if self.fallback.is_some() {
            return self.attach_local(radio, now);
        }

        let pending = self.begin_attach(fabric, radio, now)?;
        let deadline = Instant::now() + self.config.registration_timeout();
        loop {
            self.poll(fabric, now)?;
            if let Some(device_id) = self.attach_result(pending) {
                return Ok(device_id);
            }
            if Instant::now() >= deadline {
                self.pending_registrations.remove(&pending);
                let timeout = self.config.registration_timeout();
                error!(
                    local_rank = self.local_rank,
                    sequence = pending,
                    ?timeout,
                    "registration acknowledgement never arrived"
                );
                return Err(ChannelError::RegistrationTimeout(timeout));
            }
            std::thread::yield_now();
        }
    }

    /// Sends the DEVICE_REGISTER message and records the pending operation.
    /// Returns the sequence number identifying the round-trip.
    ///
    /// Split out from [`ChannelStub::attach`] so a cooperative driver can
    /// interleave processor polls instead of blocking.
    pub fn begin_attach<F: Fabric>(
        &mut self,
        fabric: &mut F,
        radio: &RadioHandle,
        now: SimTime,
    ) -> ChannelResult<SequenceNumber> {
        if self.shutting_down {
            return Err(ChannelError::Shutdown);
        }

        let (body, position) = {
            let r = radio.borrow();
            (
                crate::wire::DeviceRegisterBody {
                    phy_id: r.phy_id(),
                    phy_type: r.phy_type(),
                    channel_number: r.channel_number(),
                    channel_width_mhz: r.channel_width_mhz(),
                    node_id: r.node_id(),
                    position: r.position(),
                },
                r.position(),
            )
        };

        let header = self.header(MessageType::DeviceRegister, now, 0);
        let sequence = self.send(
            fabric,
            Message {
                header,
                body: Body::DeviceRegister(body),
            },
        )?;
        self.pending_registrations.insert(
            sequence,
            PendingRegistration {
                radio: Rc::downgrade(radio),
                position,
                resolved: None,
            },
        );
        Ok(sequence)
    }

    /// Takes the result of a pending attach, if its acknowledgement has
    /// arrived.
    pub fn attach_result(&mut self, pending: SequenceNumber) -> Option<DeviceId> {
        if self.pending_registrations.get(&pending)?.resolved.is_some() {
            let registration = self.pending_registrations.remove(&pending)?;
            let device_id = registration.resolved?;
            self.radios.insert(device_id, registration.radio);
            self.last_sent_position.insert(device_id, registration.position);
            info!(
                device_id,
                local_rank = self.local_rank,
                "radio attached"
            );
            return Some(device_id);
        }
        None
    }

    fn attach_local(&mut self, radio: &RadioHandle, now: SimTime) -> ChannelResult<DeviceId> {
        if self.shutting_down {
            return Err(ChannelError::Shutdown);
        }
        let fallback = self.fallback.as_mut().expect("fallback mode");
        let (node_id, phy_id, channel_number, position) = {
            let r = radio.borrow();
            (r.node_id(), r.phy_id(), r.channel_number(), r.position())
        };
        let frequencies = [channel_center_frequency_hz(channel_number)]
            .into_iter()
            .collect();
        let device_id =
            fallback
                .registry
                .register(self.local_rank, node_id, phy_id, position, frequencies, now);
        self.summary
            .observe_device_count(fallback.registry.device_count());
        self.radios.insert(device_id, Rc::downgrade(radio));
        self.last_sent_position.insert(device_id, position);
        info!(device_id, "radio attached (fallback)");
        Ok(device_id)
    }

    // ── Upward operations ────────────────────────────────────────────────────

    /// Transmits a frame from an attached radio.
    ///
    /// In distributed mode this emits a TX_REQUEST stamped with the current
    /// simulation time and performs no propagation locally.
    pub fn send_frame<F: Fabric>(
        &mut self,
        fabric: &mut F,
        sender: &RadioHandle,
        payload: Bytes,
        tx_power_w: f64,
        tx_vector: Bytes,
        now: SimTime,
    ) -> ChannelResult<()> {
        if self.shutting_down {
            return Err(ChannelError::Shutdown);
        }
        let device_id = self
            .device_id_of(sender)
            .ok_or(ChannelError::UnknownDevice(0))?;
        let phy_id = sender.borrow().phy_id();

        if self.fallback.is_some() {
            return self.send_local(device_id, payload, tx_power_w, now);
        }

        let header = self.header(MessageType::TxRequest, now, device_id);
        self.send(
            fabric,
            Message {
                header,
                body: Body::TxRequest(TxRequestBody {
                    device_id,
                    phy_id,
                    tx_power_pw: watts_to_picowatts(tx_power_w),
                    payload,
                    tx_vector,
                }),
            },
        )?;
        Ok(())
    }

    fn send_local(
        &mut self,
        device_id: DeviceId,
        payload: Bytes,
        tx_power_w: f64,
        now: SimTime,
    ) -> ChannelResult<()> {
        let fallback = self.fallback.as_mut().expect("fallback mode");
        let record = fallback
            .registry
            .get(device_id)
            .ok_or(ChannelError::UnknownDevice(device_id))?;
        let frequency_hz = record.primary_frequency().ok_or_else(|| {
            ChannelError::Model(format!("transmitter {device_id} has no registered frequency"))
        })?;

        // Round-trip the power through the canonical picowatt encoding so
        // fallback numerics match what the wire would have carried.
        let tx = TransmissionDescriptor {
            transmitter: device_id,
            source_rank: self.local_rank,
            tx_power_w: picowatts_to_watts(watts_to_picowatts(tx_power_w)),
            frequency_hz,
            payload: payload.clone(),
            tx_vector: Bytes::new(),
            tx_timestamp: now,
            sequence: 0,
        };
        let receptions = fallback.engine.fan_out(&tx, &fallback.registry)?;

        for reception in receptions {
            let delivery = Reception {
                transmitter: device_id,
                rx_power_w: picowatts_to_watts(watts_to_picowatts(reception.rx_power_w)),
                rx_power_dbm: reception.rx_power_dbm,
                path_loss_db: reception.path_loss_db,
                distance_m: reception.distance_m,
                frequency_hz,
                propagation_delay_ns: reception.delay_ns,
                tx_timestamp_ns: now,
                payload: payload.clone(),
            };
            self.enqueue_reception(reception.device_id, reception.reception_timestamp, delivery, now)?;
        }
        Ok(())
    }

    /// Configures the propagation loss model on the channel.
    ///
    /// The type hash and parameter blob are also remembered locally so that
    /// queries stay consistent before the channel rank acknowledges.
    pub fn set_loss_model<F: Fabric>(
        &mut self,
        fabric: &mut F,
        model_type_hash: u32,
        params: Bytes,
        now: SimTime,
    ) -> ChannelResult<()> {
        self.configured_loss = Some(model_type_hash);
        if let Some(fallback) = self.fallback.as_mut() {
            let model = fallback.catalog.build_loss(model_type_hash, &params)?;
            fallback.engine.set_loss_model(model);
            return Ok(());
        }

        let header = self.header(MessageType::ConfigLossModel, now, 0);
        self.send(
            fabric,
            Message {
                header,
                body: Body::Config(ConfigBody {
                    target: ConfigTarget::LossModel,
                    model_type_hash,
                    params,
                }),
            },
        )?;
        Ok(())
    }

    /// Configures the propagation delay model on the channel.
    pub fn set_delay_model<F: Fabric>(
        &mut self,
        fabric: &mut F,
        model_type_hash: u32,
        params: Bytes,
        now: SimTime,
    ) -> ChannelResult<()> {
        self.configured_delay = Some(model_type_hash);
        if let Some(fallback) = self.fallback.as_mut() {
            let model = fallback.catalog.build_delay(model_type_hash, &params)?;
            fallback.engine.set_delay_model(model);
            return Ok(());
        }

        let header = self.header(MessageType::ConfigDelayModel, now, 0);
        self.send(
            fabric,
            Message {
                header,
                body: Body::Config(ConfigBody {
                    target: ConfigTarget::DelayModel,
                    model_type_hash,
                    params,
                }),
            },
        )?;
        Ok(())
    }

    /// Reports a position change from the mobility hook.
    ///
    /// Updates that moved the radio less than the configured epsilon since
    /// the last sent update are suppressed to bound message rate.
    pub fn notify_position_changed<F: Fabric>(
        &mut self,
        fabric: &mut F,
        device_id: DeviceId,
        new_position: Position,
        now: SimTime,
    ) -> ChannelResult<()> {
        if !self.radios.contains_key(&device_id) {
            return Err(ChannelError::UnknownDevice(device_id));
        }
        if let Some(last) = self.last_sent_position.get(&device_id) {
            if last.distance_to(&new_position) < self.config.position_epsilon_m {
                self.summary.record_suppressed_position();
                debug!(device_id, "position update suppressed by epsilon");
                return Ok(());
            }
        }
        self.last_sent_position.insert(device_id, new_position);

        if let Some(fallback) = self.fallback.as_mut() {
            fallback.registry.update_position(device_id, new_position, now);
            return Ok(());
        }

        let header = self.header(MessageType::PositionUpdate, now, device_id);
        self.send(
            fabric,
            Message {
                header,
                body: Body::PositionUpdate(PositionUpdateBody {
                    device_id,
                    position: new_position,
                    velocity: 0.0,
                    heading: 0.0,
                }),
            },
        )?;
        Ok(())
    }

    /// Detaches a radio: emits DEVICE_REMOVE and forgets the mapping.
    pub fn detach<F: Fabric>(
        &mut self,
        fabric: &mut F,
        device_id: DeviceId,
        now: SimTime,
    ) -> ChannelResult<()> {
        if self.radios.remove(&device_id).is_none() {
            warn!(device_id, "detach for unknown radio");
            return Ok(());
        }
        self.last_sent_position.remove(&device_id);

        if let Some(fallback) = self.fallback.as_mut() {
            fallback.registry.deregister(device_id);
            return Ok(());
        }

        let header = self.header(MessageType::DeviceRemove, now, device_id);
        self.send(
            fabric,
            Message {
                header,
                body: Body::Empty,
            },
        )?;
        Ok(())
    }

    /// Emits a liveness heartbeat toward the channel rank.
    pub fn heartbeat<F: Fabric>(&mut self, fabric: &mut F, now: SimTime) -> ChannelResult<()> {
        if self.fallback.is_some() {
            return Ok(());
        }
        let header = self.header(MessageType::Heartbeat, now, 0);
        self.send(
            fabric,
            Message {
                header,
                body: Body::Empty,
            },
        )?;
        Ok(())
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    /// Drains the fabric and applies every available message.
    ///
    /// `now` is the local current simulation time, used for the causal check
    /// on inbound receptions.
    pub fn poll<F: Fabric>(&mut self, fabric: &mut F, now: SimTime) -> ChannelResult<()> {
        if self.shutting_down {
            return Err(ChannelError::Shutdown);
        }
        let mut frames = Vec::new();
        fabric.drain(&mut |source, _tag, bytes| frames.push((source, bytes)));

        for (source, bytes) in frames {
            match self.apply(source, &bytes, now) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(source_rank = source, %err, "fatal error in stub receive loop");
                    return Err(err);
                }
                Err(err) => {
                    warn!(source_rank = source, kind = err.kind().name(), %err, "message dropped");
                    self.summary.record_drop(err.kind());
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, source: Rank, bytes: &[u8], now: SimTime) -> ChannelResult<()> {
        let message = Message::decode(bytes).map_err(|source_err| ChannelError::Framing {
            source_rank: source,
            source: source_err,
        })?;
        let header = message.header;
        let message_type = header.message_type;
        self.summary.record_receive(message_type, bytes.len());

        debug!(
            time_ns = header.timestamp_ns,
            message_type = message_type.name(),
            source_rank = source,
            destination_rank = header.destination_rank,
            device_id = header.device_id,
            sequence = header.sequence,
            "received message"
        );

        if header.source_rank != source {
            return Err(ChannelError::Protocol {
                source_rank: source,
                detail: format!(
                    "header source rank {} does not match fabric source {source}",
                    header.source_rank
                ),
            });
        }
        if source != self.channel_rank {
            return Err(ChannelError::Protocol {
                source_rank: source,
                detail: "stub accepts messages only from the channel rank".into(),
            });
        }

        if !self.accept_sequence(source, message_type, header.sequence)? {
            return Ok(());
        }

        match (message_type, message.body) {
            (MessageType::RxNotification, Body::RxNotification(body)) => {
                self.handle_rx(&header, body, now)
            }

            (MessageType::ConfigAck, Body::ConfigAck(ack)) => {
                // Registration acks carry the assigned id; plain config acks
                // carry 0 and must not resolve a pending registration that
                // happens to share the sequence number.
                match self.pending_registrations.get_mut(&ack.context_sequence) {
                    Some(pending) if ack.device_id != 0 => {
                        pending.resolved = Some(ack.device_id);
                        debug!(
                            device_id = ack.device_id,
                            sequence = ack.context_sequence,
                            "registration acknowledged"
                        );
                    }
                    _ => {
                        debug!(sequence = ack.context_sequence, "configuration acknowledged");
                    }
                }
                Ok(())
            }

            (MessageType::ErrorNotify, Body::ErrorNotify(notify)) => {
                let kind = crate::error::ErrorKind::from_code(notify.error_kind);
                warn!(
                    source_rank = source,
                    error_kind = kind.map(|k| k.name()).unwrap_or("UNKNOWN"),
                    context_sequence = notify.context_sequence,
                    message = %notify.message_text(),
                    "error reported by channel rank"
                );
                if let Some(kind) = kind {
                    self.summary.record_drop(kind);
                }
                Ok(())
            }

            (MessageType::TxStartNotify | MessageType::TxEndNotify, Body::Empty) => {
                debug!(message_type = message_type.name(), "transmission notification");
                Ok(())
            }

            (MessageType::Heartbeat, Body::Empty) => {
                debug!(source_rank = source, "HEARTBEAT");
                Ok(())
            }

            (other, _) => Err(ChannelError::Protocol {
                source_rank: source,
                detail: format!("unexpected {} at a device stub", other.name()),
            }),
        }
    }

    fn handle_rx(
        &mut self,
        header: &Header,
        body: RxNotificationBody,
        now: SimTime,
    ) -> ChannelResult<()> {
        if !self.radios.contains_key(&body.receiver_device_id) {
            return Err(ChannelError::UnknownDevice(body.receiver_device_id));
        }

        let reception_timestamp = body.reception_timestamp();
        if header.timestamp_ns != reception_timestamp {
            debug!(
                header_ts = header.timestamp_ns,
                reception_ts = reception_timestamp,
                "header timestamp differs from derived reception time"
            );
        }

        let reception = Reception {
            transmitter: body.transmitter_device_id,
            rx_power_w: picowatts_to_watts(body.rx_power_pw),
            rx_power_dbm: body.rx_power_dbm,
            path_loss_db: body.path_loss_db,
            distance_m: body.distance_m,
            frequency_hz: body.frequency_hz,
            propagation_delay_ns: body.propagation_delay_ns,
            tx_timestamp_ns: body.tx_timestamp_ns,
            payload: body.payload,
        };
        self.enqueue_reception(body.receiver_device_id, reception_timestamp, reception, now)
    }

    fn enqueue_reception(
        &mut self,
        device_id: DeviceId,
        reception_timestamp: SimTime,
        reception: Reception,
        now: SimTime,
    ) -> ChannelResult<()> {
        if reception_timestamp < now {
            return Err(ChannelError::Causal {
                scheduled: reception_timestamp,
                now,
            });
        }
        if reception_timestamp == now {
            // Zero delay: deliver immediately instead of scheduling.
            self.deliver(device_id, reception);
            return Ok(());
        }
        self.pending_rx
            .entry(reception_timestamp)
            .or_default()
            .push((device_id, reception));
        Ok(())
    }

    /// Delivers every queued reception due at or before `now` into its
    /// radio's physical-layer entry point. Returns how many were delivered.
    pub fn advance_to(&mut self, now: SimTime) -> usize {
        let later = match now.checked_add(1) {
            Some(bound) => self.pending_rx.split_off(&bound),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.pending_rx, later);

        let mut delivered = 0;
        for (timestamp, batch) in due {
            for (device_id, reception) in batch {
                debug!(
                    time_ns = timestamp,
                    device_id,
                    transmitter = reception.transmitter,
                    "delivering reception"
                );
                if self.deliver(device_id, reception) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn deliver(&mut self, device_id: DeviceId, reception: Reception) -> bool {
        match self.radios.get(&device_id).and_then(Weak::upgrade) {
            Some(radio) => {
                radio.borrow_mut().start_receive(reception);
                true
            }
            None => {
                warn!(device_id, "radio dropped before delivery; discarding reception");
                self.radios.remove(&device_id);
                self.summary.record_drop(crate::error::ErrorKind::UnknownDevice);
                false
            }
        }
    }

    // ── Sequencing and emission ──────────────────────────────────────────────

    fn accept_sequence(
        &mut self,
        source: Rank,
        message_type: MessageType,
        sequence: SequenceNumber,
    ) -> ChannelResult<bool> {
        match self.inbound_seq.get(&(source, message_type)).copied() {
            None => {
                self.inbound_seq.insert((source, message_type), sequence);
                Ok(true)
            }
            Some(last) if sequence > last => {
                self.inbound_seq.insert((source, message_type), sequence);
                Ok(true)
            }
            Some(last) if sequence == last => {
                warn!(
                    source_rank = source,
                    message_type = message_type.name(),
                    sequence,
                    "duplicate message dropped"
                );
                self.summary.record_duplicate();
                Ok(false)
            }
            Some(last) => Err(ChannelError::SequenceRegression {
                source_rank: source,
                type_name: message_type.name(),
                got: sequence,
                last,
            }),
        }
    }

    fn header(
        &self,
        message_type: MessageType,
        timestamp_ns: SimTime,
        device_id: DeviceId,
    ) -> Header {
        Header {
            message_type,
            total_length: 0,
            source_rank: self.local_rank,
            destination_rank: self.channel_rank,
            timestamp_ns,
            sequence: 0,
            device_id,
            reserved: 0,
            header_version: HEADER_VERSION,
            body_checksum: 0,
        }
    }

    /// Stamps the next outbound sequence, encodes, and hands the message to
    /// the fabric. Returns the sequence used.
    fn send<F: Fabric>(
        &mut self,
        fabric: &mut F,
        mut message: Message,
    ) -> ChannelResult<SequenceNumber> {
        let message_type = message.header.message_type;
        let next = self.outbound_seq.entry(message_type).or_insert(0);
        *next += 1;
        message.header.sequence = *next;
        let sequence = *next;

        let bytes = message
            .encode(self.config.checksum_enabled)
            .map_err(|err| ChannelError::Fabric(format!("encode failed: {err}")))?;
        self.summary.record_send(message_type, bytes.len());
        fabric.send(self.channel_rank, tag_for(message_type), bytes)?;
        Ok(sequence)
    }

    /// Tears the stub down. Pending attaches resolve with `Shutdown`;
    /// queued receptions are discarded.
    pub fn shutdown(&mut self) {
        info!(
            local_rank = self.local_rank,
            sent = self.summary.total_sent(),
            received = self.summary.total_received(),
            drops = self.summary.total_drops(),
            suppressed_positions = self.summary.position_updates_suppressed,
            pending_receptions = self.pending_reception_count(),
            "channel stub shutting down"
        );
        self.pending_registrations.clear();
        self.pending_rx.clear();
        self.radios.clear();
        self.shutting_down = true;
    }
}
