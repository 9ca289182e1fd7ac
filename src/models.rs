//! Model catalog: the capability interface over `CONFIG_*` messages.
//!
//! Loss and delay models travel on the wire as a type hash plus an opaque
//! parameter blob. The catalog maps registered type hashes to factories that
//! rebuild a model instance from its blob; the core never interprets the
//! blob itself. Implementations can register their own model types by name.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};
use crate::propagation::{
    ConstantSpeedDelay, FixedDelay, FreeSpaceLoss, LogDistanceLoss, PropagationDelayModel,
    PropagationLossModel,
};

/// Canonical name of the default free-space loss model.
pub const FREE_SPACE_LOSS: &str = "airwave.loss.free-space";

/// Canonical name of the log-distance loss model.
pub const LOG_DISTANCE_LOSS: &str = "airwave.loss.log-distance";

/// Canonical name of the default constant-speed delay model.
pub const CONSTANT_SPEED_DELAY: &str = "airwave.delay.constant-speed";

/// Canonical name of the fixed delay model.
pub const FIXED_DELAY: &str = "airwave.delay.fixed";

/// Wire hash of a canonical model name: the first four bytes of its BLAKE3
/// hash, read in network byte order. Stable across platforms and runs.
pub fn model_type_hash(name: &str) -> u32 {
    let hash = blake3::hash(name.as_bytes());
    u32::from_be_bytes(hash.as_bytes()[..4].try_into().expect("blake3 is 32 bytes"))
}

/// Factory rebuilding a loss model from its wire parameter blob.
pub type LossModelFactory =
    Arc<dyn Fn(&[u8]) -> ChannelResult<Box<dyn PropagationLossModel>> + Send + Sync>;

/// Factory rebuilding a delay model from its wire parameter blob.
pub type DelayModelFactory =
    Arc<dyn Fn(&[u8]) -> ChannelResult<Box<dyn PropagationDelayModel>> + Send + Sync>;

/// Parameter blob for [`LogDistanceLoss`]: exponent then reference loss,
/// both IEEE-754 doubles in network byte order.
pub fn log_distance_params(exponent: f64, reference_loss_db: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_f64(exponent);
    buf.put_f64(reference_loss_db);
    buf.freeze()
}

/// Parameter blob for [`FixedDelay`]: delay in nanoseconds, unsigned 64-bit
/// in network byte order.
pub fn fixed_delay_params(delay_ns: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(delay_ns);
    buf.freeze()
}

/// Registry of model factories keyed by wire type hash.
#[derive(Default)]
pub struct ModelCatalog {
    loss: HashMap<u32, LossModelFactory>,
    delay: HashMap<u32, DelayModelFactory>,
}

impl ModelCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog with the built-in models registered.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();

        catalog.register_loss(model_type_hash(FREE_SPACE_LOSS), |params| {
            if !params.is_empty() {
                return Err(ChannelError::Model(format!(
                    "free-space loss takes no parameters, got {} bytes",
                    params.len()
                )));
            }
            Ok(Box::new(FreeSpaceLoss))
        });

        catalog.register_loss(model_type_hash(LOG_DISTANCE_LOSS), |params| {
            let mut buf = params;
            if buf.len() != 16 {
                return Err(ChannelError::Model(format!(
                    "log-distance loss expects 16 parameter bytes, got {}",
                    buf.len()
                )));
            }
            let exponent = buf.get_f64();
            let reference_loss_db = buf.get_f64();
            if !exponent.is_finite() || !reference_loss_db.is_finite() {
                return Err(ChannelError::Model(
                    "log-distance parameters must be finite".into(),
                ));
            }
            Ok(Box::new(LogDistanceLoss {
                exponent,
                reference_loss_db,
            }))
        });

        catalog.register_delay(model_type_hash(CONSTANT_SPEED_DELAY), |params| {
            if !params.is_empty() {
                return Err(ChannelError::Model(format!(
                    "constant-speed delay takes no parameters, got {} bytes",
                    params.len()
                )));
            }
            Ok(Box::new(ConstantSpeedDelay))
        });

        catalog.register_delay(model_type_hash(FIXED_DELAY), |params| {
            let mut buf = params;
            if buf.len() != 8 {
                return Err(ChannelError::Model(format!(
                    "fixed delay expects 8 parameter bytes, got {}",
                    buf.len()
                )));
            }
            Ok(Box::new(FixedDelay {
                delay_ns: buf.get_u64(),
            }))
        });

        catalog
    }

    /// Registers a loss-model factory under a wire type hash.
    pub fn register_loss<F>(&mut self, type_hash: u32, factory: F)
    where
        F: Fn(&[u8]) -> ChannelResult<Box<dyn PropagationLossModel>> + Send + Sync + 'static,
    {
        self.loss.insert(type_hash, Arc::new(factory));
    }

    /// Registers a delay-model factory under a wire type hash.
    pub fn register_delay<F>(&mut self, type_hash: u32, factory: F)
    where
        F: Fn(&[u8]) -> ChannelResult<Box<dyn PropagationDelayModel>> + Send + Sync + 'static,
    {
        self.delay.insert(type_hash, Arc::new(factory));
    }

    /// Builds a loss model from its wire representation.
    pub fn build_loss(
        &self,
        type_hash: u32,
        params: &[u8],
    ) -> ChannelResult<Box<dyn PropagationLossModel>> {
        let factory = self.loss.get(&type_hash).ok_or_else(|| {
            ChannelError::Model(format!("unknown loss model type 0x{type_hash:08x}"))
        })?;
        debug!(type_hash = format_args!("0x{type_hash:08x}"), "building loss model");
        factory(params)
    }

    /// Builds a delay model from its wire representation.
    pub fn build_delay(
        &self,
        type_hash: u32,
        params: &[u8],
    ) -> ChannelResult<Box<dyn PropagationDelayModel>> {
        let factory = self.delay.get(&type_hash).ok_or_else(|| {
            ChannelError::Model(format!("unknown delay model type 0x{type_hash:08x}"))
        })?;
        debug!(type_hash = format_args!("0x{type_hash:08x}"), "building delay model");
        factory(params)
    }

    /// True if a loss model with this hash is registered.
    pub fn has_loss(&self, type_hash: u32) -> bool {
        self.loss.contains_key(&type_hash)
    }

    /// True if a delay model with this hash is registered.
    pub fn has_delay(&self, type_hash: u32) -> bool {
        self.delay.contains_key(&type_hash)
    }
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCatalog")
            .field("loss_types", &self.loss.keys().collect::<Vec<_>>())
            .field("delay_types", &self.delay.keys().collect::<Vec<_>>())
            .finish()
    }
}
