//! CERTA Node - certifier and applier tasks

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use certa_cert::{CertOutcome, CertStats, Certification, TrxHandle, TrxRef};
use certa_core::{ConnId, Seqno, TrxId, TrxPosition, TrxState, WriteSet};

use crate::{ApplyError, ApplyMonitor, NodeConfig, NodeError, NodeResult, PurgePolicy};

/// Storage collaborator applying certified write sets
pub trait Applier: Send + Sync + 'static {
    /// Apply `trx`'s write set. Runs on a blocking thread.
    fn apply(&self, trx: &TrxHandle) -> Result<(), ApplyError>;
}

/// One item of the ordered delivery stream
pub struct Delivery {
    pub trx: TrxRef,
    pub global_seqno: Seqno,
    reply: Option<oneshot::Sender<CertOutcome>>,
}

impl Delivery {
    pub fn new(trx: TrxRef, global_seqno: Seqno) -> Self {
        Delivery {
            trx,
            global_seqno,
            reply: None,
        }
    }

    /// Wrap a write set received from another node
    pub fn remote(conn_id: ConnId, trx_id: TrxId, write_set: WriteSet, global_seqno: Seqno) -> Self {
        let trx = TrxHandle::new_remote(conn_id, trx_id);
        trx.assign_write_set(write_set);
        Delivery::new(trx, global_seqno)
    }
}

/// Ordered stream event consumed by the certifier
enum StreamEvent {
    Trx(Delivery),
    /// Every member has applied up to this seqno
    CommitCut(Seqno),
}

/// Certified trx handed to an applier, carrying one reference
pub struct Applicable {
    pub trx: TrxRef,
    pub outcome: CertOutcome,
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
    pub cert: CertStats,
    pub delivered: u64,
    pub applied: u64,
    pub cancelled: u64,
    pub last_left: Seqno,
}

/// CERTA Node - owns the certifier and applier tasks
pub struct Node {
    delivery_tx: mpsc::Sender<StreamEvent>,
    monitor: Arc<ApplyMonitor>,
    stats: Arc<RwLock<RuntimeStats>>,
    certifier: JoinHandle<NodeResult<()>>,
    appliers: Vec<JoinHandle<NodeResult<()>>>,
}

impl Node {
    /// Validate `config` and spawn the node's tasks on the current tokio runtime
    pub fn start(config: NodeConfig, applier: Arc<dyn Applier>) -> NodeResult<Self> {
        config.validate()?;

        let monitor = Arc::new(ApplyMonitor::new(config.start_position));
        let stats = Arc::new(RwLock::new(RuntimeStats {
            last_left: config.start_position,
            ..RuntimeStats::default()
        }));

        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_queue);
        let (applier_tx, applier_rx) = mpsc::channel(config.applier_queue);
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let applier_rx = Arc::new(Mutex::new(applier_rx));

        let appliers = (0..config.applier_threads)
            .map(|id| {
                let worker = ApplierWorker {
                    id,
                    applier: Arc::clone(&applier),
                    jobs: Arc::clone(&applier_rx),
                    applied: applied_tx.clone(),
                    monitor: Arc::clone(&monitor),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(applied_tx);

        let certifier = Certifier {
            cert: Certification::new(config.cert.clone()),
            purge: config.purge,
            since_purge: 0,
            deliveries: delivery_rx,
            appliers: applier_tx,
            applied: applied_rx,
            monitor: Arc::clone(&monitor),
            stats: Arc::clone(&stats),
        };
        let certifier = tokio::spawn(certifier.run());

        tracing::info!(
            appliers = config.applier_threads,
            start = %config.start_position,
            isolation = ?config.cert.isolation,
            "node started"
        );

        Ok(Node {
            delivery_tx,
            monitor,
            stats,
            certifier,
            appliers,
        })
    }

    /// Hand the next delivered trx to the certifier.
    ///
    /// The returned receiver resolves with the verdict once the trx has been
    /// certified; dropping it is fine.
    pub async fn submit(
        &self,
        trx: TrxRef,
        global_seqno: Seqno,
    ) -> NodeResult<oneshot::Receiver<CertOutcome>> {
        {
            let mut guard = trx.lock();
            guard.assign_position(TrxPosition::Queued);
            if trx.is_local() {
                guard.assign_state(TrxState::Replicating);
            }
        }

        let (reply, outcome) = oneshot::channel();
        let delivery = Delivery {
            trx,
            global_seqno,
            reply: Some(reply),
        };
        self.send(StreamEvent::Trx(delivery)).await?;
        Ok(outcome)
    }

    pub async fn deliver(&self, delivery: Delivery) -> NodeResult<()> {
        delivery.trx.lock().assign_position(TrxPosition::Queued);
        self.send(StreamEvent::Trx(delivery)).await
    }

    /// Deliver a cluster-wide commit cut.
    ///
    /// Cuts sit in the delivery stream, so every replica purges at the same
    /// point of the certification order.
    pub async fn commit_cut(&self, seqno: Seqno) -> NodeResult<()> {
        self.send(StreamEvent::CommitCut(seqno)).await
    }

    async fn send(&self, event: StreamEvent) -> NodeResult<()> {
        self.delivery_tx
            .send(event)
            .await
            .map_err(|_| NodeError::Stopped)
    }

    pub fn monitor(&self) -> &Arc<ApplyMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats.read().clone()
    }

    /// Stop accepting deliveries, drain every queued trx and join all tasks
    pub async fn shutdown(self) -> NodeResult<RuntimeStats> {
        drop(self.delivery_tx);

        let mut errors: Vec<NodeError> = join(self.certifier).await.err().into_iter().collect();
        for applier in self.appliers {
            if let Err(e) = join(applier).await {
                errors.push(e);
            }
        }
        // Report the root cause, not the tasks it stopped
        errors.sort_by_key(|e| matches!(e, NodeError::Stopped));
        let first_err = errors.into_iter().next();

        let stats = self.stats.read().clone();
        tracing::info!(
            certified = stats.cert.certified,
            conflicts = stats.cert.conflicts,
            applied = stats.applied,
            "node stopped"
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

async fn join(handle: JoinHandle<NodeResult<()>>) -> NodeResult<()> {
    handle.await.map_err(|e| NodeError::Join(e.to_string()))?
}

/// Sole owner of the certification engine
struct Certifier {
    cert: Certification,
    purge: PurgePolicy,
    since_purge: u64,
    deliveries: mpsc::Receiver<StreamEvent>,
    appliers: mpsc::Sender<Applicable>,
    applied: mpsc::UnboundedReceiver<Seqno>,
    monitor: Arc<ApplyMonitor>,
    stats: Arc<RwLock<RuntimeStats>>,
}

impl Certifier {
    async fn run(mut self) -> NodeResult<()> {
        let result = self.certify_loop().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "certifier stopped");
            self.monitor.poison();
            return result;
        }

        // Deliveries are exhausted: let appliers drain, then purge the rest
        let Certifier {
            mut cert,
            appliers,
            mut applied,
            monitor,
            stats,
            ..
        } = self;
        drop(appliers);
        while applied.recv().await.is_some() {}

        let purged = cert.purge_trxs_upto(monitor.last_left());
        stats.write().cert = cert.stats();
        purged.map(|_| ()).map_err(NodeError::from)
    }

    async fn certify_loop(&mut self) -> NodeResult<()> {
        loop {
            tokio::select! {
                biased;
                Some(_) = self.applied.recv() => {
                    if let PurgePolicy::LocalApply { interval } = self.purge {
                        self.since_purge += 1;
                        if self.since_purge >= interval {
                            self.since_purge = 0;
                            self.purge_upto(self.monitor.last_left())?;
                        }
                    }
                }
                event = self.deliveries.recv() => match event {
                    Some(StreamEvent::Trx(delivery)) => self.certify(delivery).await?,
                    Some(StreamEvent::CommitCut(seqno)) => {
                        tracing::debug!(%seqno, last_left = %self.monitor.last_left(), "commit cut");
                        self.purge_upto(seqno)?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn certify(&mut self, delivery: Delivery) -> NodeResult<()> {
        let Delivery {
            trx,
            global_seqno,
            reply,
        } = delivery;

        let outcome = self.cert.append_trx(&trx, global_seqno)?;

        if let Some(reply) = reply {
            let _ = reply.send(outcome.clone());
        }

        {
            let mut stats = self.stats.write();
            stats.delivered += 1;
            stats.cert = self.cert.stats();
        }

        if !outcome.is_certified() {
            // Losers still occupy their seqno in the apply order
            self.monitor.leave(global_seqno);
            let mut stats = self.stats.write();
            stats.cancelled += 1;
            stats.last_left = self.monitor.last_left();
            return Ok(());
        }

        self.appliers
            .send(Applicable { trx, outcome })
            .await
            .map_err(|_| NodeError::Stopped)
    }

    fn purge_upto(&mut self, seqno: Seqno) -> NodeResult<()> {
        self.cert.purge_trxs_upto(seqno)?;
        self.stats.write().cert = self.cert.stats();
        Ok(())
    }
}

struct ApplierWorker {
    id: usize,
    applier: Arc<dyn Applier>,
    jobs: Arc<Mutex<mpsc::Receiver<Applicable>>>,
    applied: mpsc::UnboundedSender<Seqno>,
    monitor: Arc<ApplyMonitor>,
    stats: Arc<RwLock<RuntimeStats>>,
}

impl ApplierWorker {
    async fn run(self) -> NodeResult<()> {
        let result = self.apply_loop().await;
        if let Err(e) = &result {
            tracing::error!(applier = self.id, error = %e, "applier stopped");
            self.monitor.poison();
        }
        result
    }

    async fn apply_loop(&self) -> NodeResult<()> {
        loop {
            let job = self.jobs.lock().await.recv().await;
            let Some(Applicable { trx, outcome }) = job else {
                return Ok(());
            };
            let seqno = outcome.global_seqno;

            self.monitor.wait_for(outcome.last_depends_seqno).await?;

            let applier = Arc::clone(&self.applier);
            let target = Arc::clone(&trx);
            tokio::task::spawn_blocking(move || applier.apply(&target))
                .await
                .map_err(|e| NodeError::Join(e.to_string()))??;

            Certification::set_trx_committed(&trx);
            drop(trx);
            self.monitor.leave(seqno);

            {
                let mut stats = self.stats.write();
                stats.applied += 1;
                stats.last_left = self.monitor.last_left();
            }
            tracing::trace!(applier = self.id, %seqno, "applied");

            // Certifier may already be draining
            let _ = self.applied.send(seqno);
        }
    }
}
