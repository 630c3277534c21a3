//! Replica fuzzer - checks that certification is deterministic
//!
//! Every replica certifies the same generated stream with its own engine and
//! applies certified trxs at its own random pace. Checks:
//! - all replicas reach identical verdicts and dependencies
//! - verdicts match a brute-force reference model
//! - the index only references live, certified trxs
//! - a certified trx depends on an earlier seqno only
//! - a row's dependency never drops across commit cuts

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use certa_cert::{CertConfig, Certification, TrxHandle, TrxRef, Verdict};
use certa_core::{
    CertError, ConnId, Isolation, KeyRecord, NodeId, RowKey, Seqno, TrxPosition, WriteSet,
};

use crate::{StreamItem, WorkloadConfig, WorkloadGenerator};

#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("Replica {replica} disagrees with the reference model at seqno {seqno}")]
    ModelMismatch { replica: NodeId, seqno: Seqno },

    #[error("Replica {replica} broke an index invariant: {reason}")]
    Invariant { replica: NodeId, reason: String },
}

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    pub workload: WorkloadConfig,
    /// Number of replicas certifying the stream
    pub replica_count: usize,
    pub cert: CertConfig,
    /// Chance that a replica applies one more pending trx after a delivery
    pub apply_prob: f64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            workload: WorkloadConfig::default(),
            replica_count: 3,
            cert: CertConfig::default(),
            apply_prob: 0.6,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            workload: WorkloadConfig::light(),
            ..FuzzerConfig::default()
        }
    }

    /// Contended rows, many conflicts
    pub fn hot_rows() -> Self {
        FuzzerConfig {
            workload: WorkloadConfig::hot_rows(),
            replica_count: 4,
            apply_prob: 0.3,
            ..FuzzerConfig::default()
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            workload: WorkloadConfig::heavy(),
            replica_count: 5,
            ..FuzzerConfig::default()
        }
    }

    pub fn serializable(self) -> Self {
        FuzzerConfig {
            cert: CertConfig::serializable(),
            ..self
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        FuzzerConfig {
            workload: self.workload.with_seed(seed),
            ..self
        }
    }
}

/// What a replica decided for one trx
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub global_seqno: Seqno,
    pub verdict: Verdict,
    pub last_depends_seqno: Seqno,
}

/// One replica: a certification engine plus a lagging applier
pub struct Replica {
    pub node_id: NodeId,
    cert: Certification,
    rng: StdRng,
    apply_prob: f64,
    /// Certified, not yet applied, in seqno order
    pending: VecDeque<(TrxRef, Seqno)>,
    decisions: Vec<Decision>,
    applied: u64,
}

impl Replica {
    pub fn new(node_id: NodeId, cert: CertConfig, apply_prob: f64, seed: u64) -> Self {
        Replica {
            node_id,
            cert: Certification::new(cert),
            rng: StdRng::seed_from_u64(seed),
            apply_prob,
            pending: VecDeque::new(),
            decisions: Vec::new(),
            applied: 0,
        }
    }

    /// Process one stream item
    pub fn process(&mut self, item: &StreamItem) -> Result<(), FuzzError> {
        match item {
            StreamItem::Trx {
                trx_id,
                global_seqno,
                write_set,
            } => {
                let trx = TrxHandle::new_remote(ConnId::new(0), *trx_id);
                trx.assign_write_set(write_set.clone());

                let outcome = self.cert.append_trx(&trx, *global_seqno)?;
                self.decisions.push(Decision {
                    global_seqno: *global_seqno,
                    verdict: outcome.verdict,
                    last_depends_seqno: outcome.last_depends_seqno,
                });
                if outcome.is_certified() {
                    self.pending.push_back((trx, outcome.last_depends_seqno));
                }

                while self.rng.gen::<f64>() < self.apply_prob && !self.pending.is_empty() {
                    self.apply_one();
                }
            }
            StreamItem::CommitCut(seqno) => {
                // A cut is only issued once every member applied up to it
                while self
                    .pending
                    .front()
                    .is_some_and(|(trx, _)| trx.global_seqno() <= *seqno)
                {
                    self.apply_oldest();
                }
                self.cert.purge_trxs_upto(*seqno)?;
            }
        }
        Ok(())
    }

    /// Apply a random pending trx whose dependency is no longer pending
    fn apply_one(&mut self) {
        let ready: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, (_, depends))| {
                !self
                    .pending
                    .iter()
                    .any(|(trx, _)| trx.global_seqno() == *depends)
            })
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return;
        }

        let pick = ready[self.rng.gen_range(0..ready.len())];
        if let Some((trx, _)) = self.pending.remove(pick) {
            self.commit(&trx);
        }
    }

    /// The oldest pending trx never waits on another pending one
    fn apply_oldest(&mut self) {
        if let Some((trx, _)) = self.pending.pop_front() {
            self.commit(&trx);
        }
    }

    fn commit(&mut self, trx: &TrxHandle) {
        Certification::set_trx_committed(trx);
        self.applied += 1;
    }

    /// Apply everything still pending
    pub fn drain(&mut self) {
        while !self.pending.is_empty() {
            self.apply_oldest();
        }
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn certification(&self) -> &Certification {
        &self.cert
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Check the index against the trxs it references
    pub fn check_index(&self) -> Result<(), FuzzError> {
        let invariant = |reason: String| FuzzError::Invariant {
            replica: self.node_id,
            reason,
        };

        for (key, entry) in self.cert.index().iter() {
            if entry.is_empty() && entry.purged_upto().is_undefined() {
                return Err(invariant(format!("empty entry for {key:?}")));
            }
            for r in entry.refs() {
                if r.seqno() <= entry.purged_upto() {
                    return Err(invariant(format!(
                        "seqno {} on {key:?} survived purge up to {}",
                        r.seqno(),
                        entry.purged_upto()
                    )));
                }
                let trx = r
                    .upgrade()
                    .ok_or_else(|| invariant(format!("dead reference at seqno {}", r.seqno())))?;
                if trx.global_seqno() != r.seqno() {
                    return Err(invariant(format!(
                        "reference seqno {} points to trx at {}",
                        r.seqno(),
                        trx.global_seqno()
                    )));
                }
                if !matches!(trx.position(), TrxPosition::Certified | TrxPosition::Applied) {
                    return Err(invariant(format!(
                        "{} trx at seqno {} still referenced",
                        trx.position(),
                        r.seqno()
                    )));
                }
                if !trx.cert_keys().contains(key) {
                    return Err(invariant(format!(
                        "trx at seqno {} does not list {key:?}",
                        r.seqno()
                    )));
                }
            }
        }

        for decision in &self.decisions {
            if decision.verdict == Verdict::Certified
                && decision.last_depends_seqno >= decision.global_seqno
            {
                return Err(invariant(format!(
                    "seqno {} depends on {}",
                    decision.global_seqno, decision.last_depends_seqno
                )));
            }
        }

        Ok(())
    }
}

/// Brute-force certifier: scans every live trx for each incoming one
#[derive(Debug, Default)]
pub struct ReferenceModel {
    isolation: Isolation,
    live: BTreeMap<Seqno, Vec<KeyRecord>>,
    /// Newest purged seqno per row
    floors: HashMap<RowKey, Seqno>,
}

impl ReferenceModel {
    pub fn new(isolation: Isolation) -> Self {
        ReferenceModel {
            isolation,
            live: BTreeMap::new(),
            floors: HashMap::new(),
        }
    }

    pub fn certify(&mut self, global_seqno: Seqno, write_set: &WriteSet) -> Decision {
        let last_seen = write_set.last_seen_seqno();
        let mut depends = Seqno::UNDEFINED;

        for record in write_set.keys() {
            if let Some(floor) = self.floors.get(&record.key) {
                depends = depends.max(*floor);
            }
            for (prior, keys) in &self.live {
                let Some(prior_record) = keys.iter().find(|k| k.key == record.key) else {
                    continue;
                };
                let outstanding = last_seen.is_undefined() || *prior > last_seen;
                if outstanding && record.access.conflicts_with(prior_record.access, self.isolation) {
                    return Decision {
                        global_seqno,
                        verdict: Verdict::Conflict,
                        last_depends_seqno: Seqno::UNDEFINED,
                    };
                }
                depends = depends.max(*prior);
            }
        }

        self.live.insert(global_seqno, write_set.keys().to_vec());
        Decision {
            global_seqno,
            verdict: Verdict::Certified,
            last_depends_seqno: depends,
        }
    }

    pub fn purge_upto(&mut self, seqno: Seqno) {
        let keep = self.live.split_off(&seqno.next());
        for (purged, keys) in std::mem::replace(&mut self.live, keep) {
            for record in keys {
                let floor = self.floors.entry(record.key).or_insert(purged);
                *floor = (*floor).max(purged);
            }
        }
    }
}

/// Convergence check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    Diverged { replica: NodeId, seqno: Seqno },
}

impl Convergence {
    pub fn is_converged(&self) -> bool {
        matches!(self, Convergence::Converged)
    }
}

/// Fuzzing result
#[derive(Debug, Clone)]
pub struct FuzzReport {
    pub convergence: Convergence,
    pub certified: u64,
    pub conflicts: u64,
    /// Certified trxs that had to wait for an earlier one
    pub dependent: u64,
    pub purged: u64,
}

impl FuzzReport {
    pub fn is_valid(&self) -> bool {
        self.convergence.is_converged()
    }
}

/// Replica fuzzer
pub struct ReplicaFuzzer {
    config: FuzzerConfig,
    replicas: Vec<Replica>,
    model: ReferenceModel,
}

impl ReplicaFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        let replicas = (0..config.replica_count.max(1))
            .map(|i| {
                let seed = config.workload.seed.wrapping_add(i as u64 + 1);
                Replica::new(NodeId::new(i as u64), config.cert.clone(), config.apply_prob, seed)
            })
            .collect();
        let model = ReferenceModel::new(config.cert.isolation);

        ReplicaFuzzer {
            config,
            replicas,
            model,
        }
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Run the fuzzer.
    ///
    /// Engine errors and model mismatches are returned as errors; replica
    /// disagreement is reported in the result.
    pub fn run(&mut self) -> Result<FuzzReport, FuzzError> {
        let stream = WorkloadGenerator::new(self.config.workload.clone()).generate();

        for item in &stream {
            let expected = match item {
                StreamItem::Trx {
                    global_seqno,
                    write_set,
                    ..
                } => Some(self.model.certify(*global_seqno, write_set)),
                StreamItem::CommitCut(seqno) => {
                    self.model.purge_upto(*seqno);
                    None
                }
            };

            for replica in &mut self.replicas {
                replica.process(item)?;
                if let Some(expected) = expected {
                    if replica.decisions().last() != Some(&expected) {
                        return Err(FuzzError::ModelMismatch {
                            replica: replica.node_id,
                            seqno: expected.global_seqno,
                        });
                    }
                }
            }
        }

        for replica in &mut self.replicas {
            replica.check_index()?;
            replica.drain();
        }

        Ok(self.report())
    }

    fn report(&self) -> FuzzReport {
        let convergence = self.check_convergence();

        let reference = &self.replicas[0];
        let stats = reference.certification().stats();
        let dependent = reference
            .decisions()
            .iter()
            .filter(|d| d.verdict == Verdict::Certified && d.last_depends_seqno.is_defined())
            .count() as u64;

        FuzzReport {
            convergence,
            certified: stats.certified,
            conflicts: stats.conflicts,
            dependent,
            purged: stats.purged,
        }
    }

    /// Compare every replica's decisions and index with the first one
    fn check_convergence(&self) -> Convergence {
        let Some((reference, others)) = self.replicas.split_first() else {
            return Convergence::Converged;
        };
        let snapshot = reference.certification().snapshot();

        for replica in others {
            let mismatch = reference
                .decisions()
                .iter()
                .zip(replica.decisions())
                .find(|(a, b)| a != b);
            if let Some((decision, _)) = mismatch {
                return Convergence::Diverged {
                    replica: replica.node_id,
                    seqno: decision.global_seqno,
                };
            }
            if replica.decisions().len() != reference.decisions().len()
                || replica.certification().snapshot() != snapshot
            {
                return Convergence::Diverged {
                    replica: replica.node_id,
                    seqno: replica.certification().position(),
                };
            }
        }

        Convergence::Converged
    }
}
