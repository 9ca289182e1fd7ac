//! The channel processor: the long-lived service on the channel rank.
//!
//! Owns the device registry and the propagation engine, drains the fabric on
//! every safe-time advance, applies each message, and emits reception
//! notifications. All state mutation happens inside [`ChannelProcessor::poll`]
//! invocations; there are no worker threads.
//!
//! Error policy follows the fatal/local split: a fatal error (framing
//! failure, sequence regression, causal violation, fabric failure) is
//! returned to the caller, which is expected to terminate the process.
//! Local errors drop the offending message, count it in the run summary,
//! and notify the source rank.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigResult, CoreConfig};
use crate::error::{ChannelError, ChannelResult, ErrorKind};
use crate::fabric::{tag_for, Fabric};
use crate::models::ModelCatalog;
use crate::propagation::{PropagationEngine, ReceptionDescriptor, TransmissionDescriptor};
use crate::registry::{channel_center_frequency_hz, DeviceRegistry};
use crate::stats::RunSummary;
use crate::types::{
    picowatts_to_watts, watts_to_picowatts, DeviceId, Rank, SequenceNumber, SimTime,
};
use crate::wire::{
    Body, ConfigAckBody, ConfigTarget, ErrorNotifyBody, Header, Message, MessageType,
    RxNotificationBody, HEADER_VERSION,
};

/// Slack allowed on incoming header timestamps beyond the safe time before
/// the violation is logged. The host scheduler remains the causality
/// authority, so the message is not dropped.
const TIMESTAMP_TOLERANCE_NS: SimTime = 1_000_000_000;

/// The service object hosted on the channel rank.
///
/// At most one processor exists per process; construction fails on any rank
/// other than the configured channel rank.
pub struct ChannelProcessor {
    rank: Rank,
    world_size: u32,
    config: CoreConfig,
    registry: DeviceRegistry,
    engine: PropagationEngine,
    catalog: ModelCatalog,
    /// Last accepted sequence per (source rank, message type) stream.
    inbound_seq: HashMap<(Rank, MessageType), SequenceNumber>,
    /// Last emitted sequence per (destination rank, message type) stream.
    outbound_seq: HashMap<(Rank, MessageType), SequenceNumber>,
    summary: RunSummary,
    shutting_down: bool,
}

impl ChannelProcessor {
    /// Creates the processor for this process.
    ///
    /// Fails fast unless `rank` is the configured channel rank within the
    /// given world.
    pub fn new(config: CoreConfig, rank: Rank, world_size: u32) -> ConfigResult<Self> {
        config.validate()?;
        if rank != config.channel_rank {
            return Err(ConfigError::Validation(format!(
                "channel processor must run on rank {}, not rank {rank}",
                config.channel_rank
            )));
        }
        if rank >= world_size {
            return Err(ConfigError::Validation(format!(
                "rank {rank} outside world of size {world_size}"
            )));
        }

        let engine = PropagationEngine::new(config.reception_threshold_w);
        info!(rank, world_size, "channel processor initialized");
        Ok(Self {
            rank,
            world_size,
            config,
            registry: DeviceRegistry::new(),
            engine,
            catalog: ModelCatalog::with_defaults(),
            inbound_seq: HashMap::new(),
            outbound_seq: HashMap::new(),
            summary: RunSummary::new(),
            shutting_down: false,
        })
    }

    /// This processor's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Total number of ranks in the fabric world.
    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Number of currently registered devices.
    pub fn device_count(&self) -> usize {
        self.registry.device_count()
    }

    /// Read access to the registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The run summary so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Registers additional model types beyond the built-ins.
    pub fn catalog_mut(&mut self) -> &mut ModelCatalog {
        &mut self.catalog
    }

    /// Drains every available message from the fabric and applies it.
    ///
    /// Called on every safe-time advance. Local errors are absorbed (counted
    /// and reported to the source); fatal errors abort the poll and must
    /// abort the process.
    pub fn poll<F: Fabric>(&mut self, fabric: &mut F) -> ChannelResult<()> {
        if self.shutting_down {
            return Err(ChannelError::Shutdown);
        }

        let mut frames = Vec::new();
        fabric.drain(&mut |source, _tag, bytes| frames.push((source, bytes)));

        for (source, bytes) in frames {
            match self.apply(fabric, source, &bytes) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(source_rank = source, %err, "fatal error in receive loop");
                    return Err(err);
                }
                Err(err) => {
                    // Sequence number sits at a fixed header offset; recover
                    // it from the raw frame for the error response.
                    let context_sequence = if bytes.len() >= 28 {
                        u32::from_be_bytes(bytes[24..28].try_into().expect("4-byte slice"))
                    } else {
                        0
                    };
                    self.report_local(fabric, source, context_sequence, &err)?;
                }
            }
        }
        Ok(())
    }

    /// Tears the processor down: reports the run summary and clears the
    /// registry. Subsequent polls resolve with [`ChannelError::Shutdown`].
    pub fn shutdown(&mut self) {
        info!(
            sent = self.summary.total_sent(),
            received = self.summary.total_received(),
            drops = self.summary.total_drops(),
            duplicates = self.summary.duplicates_dropped,
            peak_devices = self.summary.peak_device_count,
            "channel processor shutting down"
        );
        self.registry.clear();
        self.shutting_down = true;
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    fn apply<F: Fabric>(
        &mut self,
        fabric: &mut F,
        source: Rank,
        bytes: &[u8],
    ) -> ChannelResult<()> {
        let message = Message::decode(bytes).map_err(|source_err| ChannelError::Framing {
            source_rank: source,
            source: source_err,
        })?;
        let Message { header, body } = message;
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

        let safe_time = fabric.barrier_time();
        if header.timestamp_ns > safe_time + TIMESTAMP_TOLERANCE_NS {
            warn!(
                time_ns = header.timestamp_ns,
                safe_time_ns = safe_time,
                message_type = message_type.name(),
                source_rank = source,
                "timestamp beyond safe time plus tolerance"
            );
        }

        if !self.accept_sequence(source, message_type, header.sequence)? {
            return Ok(());
        }

        match (message_type, body) {
            (MessageType::DeviceRegister, Body::DeviceRegister(body)) => {
                let frequencies = [channel_center_frequency_hz(body.channel_number)]
                    .into_iter()
                    .collect();
                let device_id = self.registry.register(
                    source,
                    body.node_id,
                    body.phy_id,
                    body.position,
                    frequencies,
                    header.timestamp_ns,
                );
                self.summary.observe_device_count(self.registry.device_count());
                info!(
                    time_ns = header.timestamp_ns,
                    device_id,
                    source_rank = source,
                    node_id = body.node_id,
                    sequence = header.sequence,
                    "REGISTER"
                );

                let ack_header = self.header(
                    MessageType::ConfigAck,
                    source,
                    fabric.barrier_time(),
                    device_id,
                );
                self.send(
                    fabric,
                    Message {
                        header: ack_header,
                        body: Body::ConfigAck(ConfigAckBody {
                            device_id,
                            context_sequence: header.sequence,
                        }),
                    },
                )
            }

            (MessageType::DeviceRemove, Body::Empty) => {
                info!(
                    time_ns = header.timestamp_ns,
                    device_id = header.device_id,
                    source_rank = source,
                    "REMOVE"
                );
                self.registry.deregister(header.device_id);
                Ok(())
            }

            (MessageType::PositionUpdate, Body::PositionUpdate(body)) => {
                if !self.registry.is_registered(body.device_id) {
                    return Err(ChannelError::UnknownDevice(body.device_id));
                }
                self.registry
                    .update_position(body.device_id, body.position, header.timestamp_ns);
                Ok(())
            }

            (MessageType::ConfigLossModel, Body::Config(body)) => {
                if body.target != ConfigTarget::LossModel {
                    return Err(ChannelError::Protocol {
                        source_rank: source,
                        detail: "CONFIG_LOSS_MODEL body targets the delay model".into(),
                    });
                }
                let model = self.catalog.build_loss(body.model_type_hash, &body.params)?;
                self.engine.set_loss_model(model);
                info!(
                    time_ns = header.timestamp_ns,
                    source_rank = source,
                    model_type = format_args!("0x{:08x}", body.model_type_hash),
                    "CONFIG_LOSS_MODEL"
                );
                self.ack_config(fabric, source, header.sequence)
            }

            (MessageType::ConfigDelayModel, Body::Config(body)) => {
                if body.target != ConfigTarget::DelayModel {
                    return Err(ChannelError::Protocol {
                        source_rank: source,
                        detail: "CONFIG_DELAY_MODEL body targets the loss model".into(),
                    });
                }
                let model = self.catalog.build_delay(body.model_type_hash, &body.params)?;
                self.engine.set_delay_model(model);
                info!(
                    time_ns = header.timestamp_ns,
                    source_rank = source,
                    model_type = format_args!("0x{:08x}", body.model_type_hash),
                    "CONFIG_DELAY_MODEL"
                );
                self.ack_config(fabric, source, header.sequence)
            }

            (MessageType::TxRequest, Body::TxRequest(body)) => {
                self.process_tx_request(fabric, source, header.timestamp_ns, header.sequence, body)
            }

            (MessageType::Heartbeat, Body::Empty) => {
                debug!(source_rank = source, "HEARTBEAT");
                Ok(())
            }

            (other, _) => Err(ChannelError::Protocol {
                source_rank: source,
                detail: format!("unexpected {} at the channel processor", other.name()),
            }),
        }
    }

    fn process_tx_request<F: Fabric>(
        &mut self,
        fabric: &mut F,
        source: Rank,
        tx_timestamp: SimTime,
        sequence: SequenceNumber,
        body: crate::wire::TxRequestBody,
    ) -> ChannelResult<()> {
        let record = self
            .registry
            .get(body.device_id)
            .ok_or(ChannelError::UnknownDevice(body.device_id))?;
        if record.owning_rank != source {
            return Err(ChannelError::Protocol {
                source_rank: source,
                detail: format!(
                    "TX_REQUEST for device {} owned by rank {}",
                    body.device_id, record.owning_rank
                ),
            });
        }
        let frequency_hz = record.primary_frequency().ok_or_else(|| {
            ChannelError::Model(format!(
                "transmitter {} has no registered frequency",
                body.device_id
            ))
        })?;

        let tx = TransmissionDescriptor {
            transmitter: body.device_id,
            source_rank: source,
            tx_power_w: picowatts_to_watts(body.tx_power_pw),
            frequency_hz,
            payload: body.payload,
            tx_vector: body.tx_vector,
            tx_timestamp,
            sequence,
        };

        info!(
            time_ns = tx_timestamp,
            device_id = tx.transmitter,
            source_rank = source,
            sequence,
            tx_power_pw = body.tx_power_pw,
            "TX_PROCESS"
        );

        let receptions = self.engine.fan_out(&tx, &self.registry)?;
        for reception in receptions {
            self.notify_reception(fabric, &tx, reception)?;
        }
        Ok(())
    }

    fn notify_reception<F: Fabric>(
        &mut self,
        fabric: &mut F,
        tx: &TransmissionDescriptor,
        reception: ReceptionDescriptor,
    ) -> ChannelResult<()> {
        // The lookahead contract: a reception may never be scheduled behind
        // the safe time. Conservative synchronization guarantees this; a
        // violation is a bug and fatal.
        let safe_time = fabric.barrier_time();
        if reception.reception_timestamp < safe_time {
            return Err(ChannelError::Causal {
                scheduled: reception.reception_timestamp,
                now: safe_time,
            });
        }

        let header = self.header(
            MessageType::RxNotification,
            reception.owning_rank,
            reception.reception_timestamp,
            reception.device_id,
        );
        let body = RxNotificationBody {
            receiver_device_id: reception.device_id,
            transmitter_device_id: tx.transmitter,
            phy_id: reception.phy_id,
            rx_power_pw: watts_to_picowatts(reception.rx_power_w),
            rx_power_dbm: reception.rx_power_dbm,
            path_loss_db: reception.path_loss_db,
            distance_m: reception.distance_m,
            frequency_hz: tx.frequency_hz,
            propagation_delay_ns: reception.delay_ns,
            tx_timestamp_ns: tx.tx_timestamp,
            payload: tx.payload.clone(),
        };

        info!(
            time_ns = reception.reception_timestamp,
            device_id = reception.device_id,
            destination_rank = reception.owning_rank,
            rx_power_dbm = reception.rx_power_dbm,
            distance_m = reception.distance_m,
            "RX_NOTIFY_SENT"
        );

        self.send(
            fabric,
            Message {
                header,
                body: Body::RxNotification(body),
            },
        )
    }

    // ── Sequencing and emission ──────────────────────────────────────────────

    /// Enforces per-stream monotonicity. Returns false for an exact replay
    /// (dropped, counted), errors fatally on a regression.
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
        destination: Rank,
        timestamp_ns: SimTime,
        device_id: DeviceId,
    ) -> Header {
        Header {
            message_type,
            total_length: 0,
            source_rank: self.rank,
            destination_rank: destination,
            timestamp_ns,
            sequence: 0,
            device_id,
            reserved: 0,
            header_version: HEADER_VERSION,
            body_checksum: 0,
        }
    }

    fn send<F: Fabric>(&mut self, fabric: &mut F, mut message: Message) -> ChannelResult<()> {
        let message_type = message.header.message_type;
        let destination = message.header.destination_rank;

        let next = self
            .outbound_seq
            .entry((destination, message_type))
            .or_insert(0);
        *next += 1;
        message.header.sequence = *next;

        let bytes = message
            .encode(self.config.checksum_enabled)
            .map_err(|err| ChannelError::Fabric(format!("encode failed: {err}")))?;
        self.summary.record_send(message_type, bytes.len());
        fabric.send(destination, tag_for(message_type), bytes)
    }

    fn ack_config<F: Fabric>(
        &mut self,
        fabric: &mut F,
        source: Rank,
        context_sequence: SequenceNumber,
    ) -> ChannelResult<()> {
        let header = self.header(MessageType::ConfigAck, source, fabric.barrier_time(), 0);
        self.send(
            fabric,
            Message {
                header,
                body: Body::ConfigAck(ConfigAckBody {
                    device_id: 0,
                    context_sequence,
                }),
            },
        )
    }

    /// Counts a local error, logs it, and notifies the source rank.
    fn report_local<F: Fabric>(
        &mut self,
        fabric: &mut F,
        source: Rank,
        context_sequence: SequenceNumber,
        err: &ChannelError,
    ) -> ChannelResult<()> {
        let kind = err.kind();
        warn!(source_rank = source, kind = kind.name(), %err, "message dropped");
        self.summary.record_drop(kind);

        if matches!(
            kind,
            ErrorKind::UnknownDevice | ErrorKind::ModelError | ErrorKind::ProtocolViolation
        ) {
            let header = self.header(MessageType::ErrorNotify, source, fabric.barrier_time(), 0);
            return self.send(
                fabric,
                Message {
                    header,
                    body: Body::ErrorNotify(ErrorNotifyBody {
                        error_kind: kind.code(),
                        context_sequence,
                        message: err.to_string().into(),
                    }),
                },
            );
        }
        Ok(())
    }
}
