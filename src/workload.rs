//! Operation synthesis for virtual clients.
//!
//! A [`Workload`] decides what each client sends next. The key-value
//! workload draws GET/SET/DEL from a [`WorkloadMix`] over a small per-client
//! key pool so that reads, writes and deletes contend on the same keys; the
//! broadcast workload sends numbered JSON frame documents.

use crate::benchmark::RunConfig;
use crate::cli::Protocol;
use crate::protocol::frame::FrameDocument;
use crate::protocol::{Operation, OperationKind};
use anyhow::{bail, Result};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::Rng;

/// Ordered `(category, cumulative upper bound)` bands over `[0, 1)`.
///
/// A draw `u` selects the first band with `u < upper`, so each band is
/// inclusive at its lower edge and exclusive at its upper edge. The last band
/// always ends at 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadMix {
    bands: Vec<(OperationKind, f64)>,
}

impl WorkloadMix {
    /// Key-value mix from read and write fractions; delete takes the remainder
    pub fn key_value(read: f64, write: f64) -> Result<Self> {
        for (name, value) in [("read", read), ("write", write)] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} ratio must be between 0.0 and 1.0, got {}", name, value);
            }
        }
        if read + write > 1.0 + f64::EPSILON {
            bail!(
                "read ratio ({}) plus write ratio ({}) cannot exceed 1.0",
                read,
                write
            );
        }
        Ok(Self {
            bands: vec![
                (OperationKind::Read, read),
                (OperationKind::Write, read + write),
                (OperationKind::Delete, 1.0),
            ],
        })
    }

    /// Every draw is a broadcast message
    pub fn broadcast() -> Self {
        Self {
            bands: vec![(OperationKind::Message, 1.0)],
        }
    }

    pub fn select(&self, u: f64) -> OperationKind {
        self.bands
            .iter()
            .find(|(_, upper)| u < *upper)
            .or_else(|| self.bands.last())
            .map(|(kind, _)| *kind)
            .unwrap_or(OperationKind::Read)
    }

    pub fn bands(&self) -> &[(OperationKind, f64)] {
        &self.bands
    }

    /// Share of draws that land in `kind`'s band
    pub fn weight(&self, kind: OperationKind) -> f64 {
        let mut lower = 0.0;
        for (band, upper) in &self.bands {
            if *band == kind {
                return (upper - lower).max(0.0);
            }
            lower = *upper;
        }
        0.0
    }
}

impl Default for WorkloadMix {
    fn default() -> Self {
        Self {
            bands: vec![
                (OperationKind::Read, crate::defaults::READ_RATIO),
                (
                    OperationKind::Write,
                    crate::defaults::READ_RATIO + crate::defaults::WRITE_RATIO,
                ),
                (OperationKind::Delete, 1.0),
            ],
        }
    }
}

/// The next operation a client will send, tagged with its category
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    pub operation: Operation,
}

/// Source of operations for one virtual client
pub trait Workload: Send {
    /// Operations issued once after connecting and before the main loop
    fn seed_operations(&mut self, rng: &mut StdRng) -> Vec<Operation>;

    /// Next operation of the main loop
    fn next_operation(&mut self, rng: &mut StdRng) -> Result<PlannedOperation>;
}

/// Random alphanumeric text of `len` bytes
pub fn random_value(rng: &mut StdRng, len: usize) -> String {
    std::iter::repeat_with(|| char::from(rng.sample(Alphanumeric)))
        .take(len)
        .collect()
}

/// Per-client GET/SET/DEL traffic over a fixed key pool
pub struct KeyValueWorkload {
    keys: Vec<String>,
    mix: WorkloadMix,
    payload_size: usize,
    seed_writes: usize,
}

impl KeyValueWorkload {
    pub fn new(
        client_id: usize,
        mix: WorkloadMix,
        payload_size: usize,
        key_pool_size: usize,
        seed_writes: usize,
    ) -> Self {
        let keys = (0..key_pool_size.max(1))
            .map(|i| format!("key_{}_{}", client_id, i))
            .collect();
        Self {
            keys,
            mix,
            payload_size,
            seed_writes,
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Workload for KeyValueWorkload {
    fn seed_operations(&mut self, rng: &mut StdRng) -> Vec<Operation> {
        let payload_size = self.payload_size;
        self.keys
            .iter()
            .take(self.seed_writes)
            .map(|key| Operation::set(key, random_value(rng, payload_size)))
            .collect()
    }

    fn next_operation(&mut self, rng: &mut StdRng) -> Result<PlannedOperation> {
        let kind = self.mix.select(rng.gen::<f64>());
        let key = &self.keys[rng.gen_range(0..self.keys.len())];

        let operation = match kind {
            OperationKind::Read => Operation::get(key),
            OperationKind::Write => Operation::set(key, random_value(rng, self.payload_size)),
            OperationKind::Delete => Operation::del(key),
            OperationKind::Message => bail!("key-value workload cannot send broadcast frames"),
        };
        Ok(PlannedOperation { kind, operation })
    }
}

/// Numbered frame documents for a WebSocket broadcast server
pub struct BroadcastWorkload {
    client_id: usize,
    payload_size: usize,
    seq: u64,
}

impl BroadcastWorkload {
    pub fn new(client_id: usize, payload_size: usize) -> Self {
        Self {
            client_id,
            payload_size,
            seq: 0,
        }
    }
}

impl Workload for BroadcastWorkload {
    fn seed_operations(&mut self, _rng: &mut StdRng) -> Vec<Operation> {
        Vec::new()
    }

    fn next_operation(&mut self, rng: &mut StdRng) -> Result<PlannedOperation> {
        let payload = random_value(rng, self.payload_size);
        let document = FrameDocument::new(self.client_id, self.seq, payload);
        self.seq += 1;
        Ok(PlannedOperation {
            kind: OperationKind::Message,
            operation: document.into_operation()?,
        })
    }
}

/// Build the workload for one client of a run
pub fn for_client(client_id: usize, config: &RunConfig) -> Box<dyn Workload> {
    match config.protocol {
        Protocol::Redis => Box::new(KeyValueWorkload::new(
            client_id,
            config.mix.clone(),
            config.payload_size,
            config.key_pool_size,
            config.seed_writes,
        )),
        Protocol::WebSocket => Box::new(BroadcastWorkload::new(client_id, config.payload_size)),
    }
}
