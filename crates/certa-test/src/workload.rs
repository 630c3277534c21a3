//! Workload generator - seeded streams of write sets and commit cuts
//!
//! A stream is what the group communication layer would deliver to every
//! replica: write sets in global seqno order, interleaved with commit cuts
//! marking seqnos every member has applied.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use certa_core::{NodeId, RowAction, RowKey, Seqno, TrxId, WriteSet};

/// Workload configuration
#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    /// Nodes originating write sets
    pub node_count: usize,
    pub table_count: usize,
    /// Rows per table
    pub row_count: usize,
    /// Write sets in the stream
    pub trx_count: usize,
    /// Upper bound on rows touched by one write set
    pub max_keys_per_trx: usize,
    /// Probability that a touched row is written rather than read
    pub write_prob: f64,
    /// Probability that the source lagged behind while executing
    pub stale_prob: f64,
    /// Largest lag of a stale source
    pub max_lag: i64,
    /// Probability that the source did not report its last seen seqno
    pub unknown_prob: f64,
    /// Write sets between two commit cuts, 0 disables cuts
    pub cut_interval: usize,
    /// Distance of a commit cut behind the newest seqno
    pub cut_lag: i64,
    /// Random seed
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            node_count: 3,
            table_count: 2,
            row_count: 64,
            trx_count: 1000,
            max_keys_per_trx: 4,
            write_prob: 0.5,
            stale_prob: 0.3,
            max_lag: 8,
            unknown_prob: 0.05,
            cut_interval: 16,
            cut_lag: 8,
            seed: 42,
        }
    }
}

impl WorkloadConfig {
    /// Light workload for quick tests
    pub fn light() -> Self {
        WorkloadConfig {
            row_count: 32,
            trx_count: 200,
            ..WorkloadConfig::default()
        }
    }

    /// Few rows, long lags: most write sets collide
    pub fn hot_rows() -> Self {
        WorkloadConfig {
            node_count: 5,
            table_count: 1,
            row_count: 4,
            trx_count: 500,
            max_keys_per_trx: 2,
            write_prob: 0.8,
            stale_prob: 0.6,
            max_lag: 16,
            unknown_prob: 0.1,
            cut_interval: 32,
            cut_lag: 16,
            seed: 42,
        }
    }

    /// Heavy workload for thorough testing
    pub fn heavy() -> Self {
        WorkloadConfig {
            node_count: 8,
            table_count: 4,
            row_count: 256,
            trx_count: 10_000,
            max_keys_per_trx: 8,
            write_prob: 0.6,
            stale_prob: 0.4,
            max_lag: 32,
            unknown_prob: 0.05,
            cut_interval: 64,
            cut_lag: 32,
            seed: 42,
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        WorkloadConfig { seed, ..self }
    }
}

/// One item of the delivery stream
#[derive(Clone, Debug)]
pub enum StreamItem {
    Trx {
        trx_id: TrxId,
        global_seqno: Seqno,
        write_set: WriteSet,
    },
    /// Every member has applied up to this seqno
    CommitCut(Seqno),
}

/// Workload generator
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    rng: StdRng,
    last_seqno: Seqno,
    last_cut: Seqno,
}

impl WorkloadGenerator {
    pub fn new(config: WorkloadConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        WorkloadGenerator {
            config,
            rng,
            last_seqno: Seqno::new(0),
            last_cut: Seqno::UNDEFINED,
        }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Generate the whole stream
    pub fn generate(&mut self) -> Vec<StreamItem> {
        let mut items = Vec::with_capacity(self.config.trx_count + 1);

        for n in 1..=self.config.trx_count {
            items.push(self.next_trx());

            if self.config.cut_interval > 0 && n % self.config.cut_interval == 0 {
                if let Some(cut) = self.next_cut() {
                    items.push(cut);
                }
            }
        }

        items
    }

    fn next_trx(&mut self) -> StreamItem {
        let global_seqno = self.last_seqno.next();
        self.last_seqno = global_seqno;

        let source = NodeId::new(self.rng.gen_range(0..self.config.node_count.max(1)) as u64);
        let mut builder = WriteSet::builder(source).last_seen(self.last_seen_for(global_seqno));

        let keys = self.rng.gen_range(1..=self.config.max_keys_per_trx.max(1));
        for _ in 0..keys {
            let key = self.random_row();
            let action = self.random_action();
            builder.append_row_key(key, action);
        }

        StreamItem::Trx {
            trx_id: TrxId::new(global_seqno.get() as u64),
            global_seqno,
            write_set: builder.build(),
        }
    }

    fn next_cut(&mut self) -> Option<StreamItem> {
        let cut = Seqno::new(self.last_seqno.get() - self.config.cut_lag);
        if cut.get() <= 0 || cut <= self.last_cut {
            return None;
        }
        self.last_cut = cut;
        Some(StreamItem::CommitCut(cut))
    }

    fn last_seen_for(&mut self, global_seqno: Seqno) -> Seqno {
        if self.rng.gen::<f64>() < self.config.unknown_prob {
            return Seqno::UNDEFINED;
        }

        let lag = if self.config.max_lag > 0 && self.rng.gen::<f64>() < self.config.stale_prob {
            self.rng.gen_range(1..=self.config.max_lag)
        } else {
            0
        };
        Seqno::new((global_seqno.get() - 1 - lag).max(0))
    }

    fn random_row(&mut self) -> RowKey {
        let table = self.rng.gen_range(0..self.config.table_count.max(1));
        let row = self.rng.gen_range(0..self.config.row_count.max(1));
        RowKey::new(format!("t{table}"), format!("r{row}"))
    }

    fn random_action(&mut self) -> RowAction {
        if self.rng.gen::<f64>() >= self.config.write_prob {
            return RowAction::Read;
        }
        match self.rng.gen_range(0..3) {
            0 => RowAction::Insert,
            1 => RowAction::Update,
            _ => RowAction::Delete,
        }
    }
}
