// Dispatcher actor
// Decision: one task owns the call queue, the worker map and shared reference writes
// Decision: worker lifecycle arrives as commands, so no state is touched from backend tasks

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use workerfarm_protocol::{methods, ChildId, Diagnostic, Handle, SharedRefId, Target, Value};

use super::services::Services;
use super::FarmStats;
use crate::backend::{BackendContext, BackendFactory};
use crate::config::FarmOptions;
use crate::error::FarmError;
use crate::handles::unknown_handle;
use crate::module::ModuleRegistry;
use crate::worker::{pump, Call, ControlReply, Worker, WorkerState};

/// Receivers of one control request per worker
pub(crate) type Acks = Vec<(ChildId, oneshot::Receiver<Result<Value, Diagnostic>>)>;

// =============================================================================
// Commands
// =============================================================================

pub(crate) enum Command {
    /// Queue a module call
    Call(Call),
    CreateSharedReference {
        value: Value,
        reply: oneshot::Sender<(SharedRefId, Acks)>,
    },
    DisposeSharedReference {
        id: SharedRefId,
        reply: oneshot::Sender<Acks>,
    },
    /// Run a handle owned by a worker
    RunHandle {
        handle: Handle,
        args: Vec<Value>,
        reply: ControlReply,
    },
    /// Send a control method to every ready worker
    Broadcast {
        method: &'static str,
        args: Vec<Value>,
        reply: oneshot::Sender<Acks>,
    },
    WorkerStarted(ChildId),
    WorkerReady(ChildId),
    WorkerStartFailed { id: ChildId, error: String },
    WorkerFailed { id: ChildId, error: String },
    WorkerExited { id: ChildId, code: Option<i32> },
    CallSettled(ChildId),
    Stats(oneshot::Sender<FarmStats>),
    /// Stop the farm; `reply` fires once it has ended
    End(Option<oneshot::Sender<()>>),
}

/// Counters the farm reads without a round trip to the dispatcher
#[derive(Debug, Default)]
pub(crate) struct Gauges {
    pub(crate) ending: AtomicBool,
    pub(crate) pool_size: AtomicUsize,
    pub(crate) warm_workers: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Ended,
}

// =============================================================================
// Dispatcher
// =============================================================================

pub(crate) struct Dispatcher {
    options: FarmOptions,
    worker_path: String,
    registry: ModuleRegistry,
    factory: Arc<dyn BackendFactory>,
    services: Arc<Services>,
    gauges: Arc<Gauges>,
    queue: VecDeque<Call>,
    workers: BTreeMap<ChildId, Arc<Worker>>,
    next_child_id: u64,
    startup_failures: u32,
    phase: Phase,
    drain_deadline: Option<Instant>,
    end_waiters: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    pub(crate) fn new(
        options: FarmOptions,
        worker_path: String,
        registry: ModuleRegistry,
        factory: Arc<dyn BackendFactory>,
        services: Arc<Services>,
        gauges: Arc<Gauges>,
    ) -> Self {
        Self {
            options,
            worker_path,
            registry,
            factory,
            services,
            gauges,
            queue: VecDeque::new(),
            workers: BTreeMap::new(),
            next_child_id: 0,
            startup_failures: 0,
            phase: Phase::Running,
            drain_deadline: None,
            end_waiters: Vec::new(),
        }
    }

    /// Process commands until the farm has ended
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.options.allows_remote_workers() {
            for _ in 0..self.options.max_concurrent_workers {
                self.start_worker();
            }
        }
        self.refresh_gauges();

        loop {
            let command = match self.drain_deadline {
                Some(deadline) => tokio::select! {
                    command = commands.recv() => command,
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            inflight = self.inflight_calls(),
                            "Drain timeout elapsed, stopping workers with calls in flight"
                        );
                        self.finish().await;
                        break;
                    }
                },
                None => commands.recv().await,
            };
            let Some(command) = command else {
                // Every sender is gone; nobody can observe the farm any more
                self.finish().await;
                break;
            };

            self.handle(command).await;
            if self.phase == Phase::Ended {
                break;
            }
            self.refresh_gauges();
        }
        debug!("Dispatcher stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Call(call) => {
                if self.phase != Phase::Running {
                    call.settle(Err(FarmError::Ending));
                    return;
                }
                self.queue.push_back(call);
                self.process_queue();
            }
            Command::CreateSharedReference { value, reply } => {
                let id = self.services.shared.write().allocate(value.clone());
                let acks = self
                    .workers
                    .values()
                    .filter(|worker| worker.is_started())
                    .map(|worker| {
                        worker.mark_shared_reference_sent(id);
                        let rx = worker.control(
                            Target::method(methods::CREATE_SHARED_REFERENCE),
                            vec![json!(id), value.clone()],
                        );
                        (worker.id(), rx)
                    })
                    .collect();
                debug!(shared_ref = %id, "Shared reference created");
                let _ = reply.send((id, acks));
            }
            Command::DisposeSharedReference { id, reply } => {
                self.services.shared.write().remove(id);
                let acks = self
                    .workers
                    .values()
                    .filter(|worker| worker.forget_shared_reference(id) && !worker.is_stopping())
                    .map(|worker| {
                        let rx = worker.control(
                            Target::method(methods::DELETE_SHARED_REFERENCE),
                            vec![json!(id)],
                        );
                        (worker.id(), rx)
                    })
                    .collect();
                debug!(shared_ref = %id, "Shared reference disposed");
                let _ = reply.send(acks);
            }
            Command::RunHandle {
                handle,
                args,
                reply,
            } => {
                let owner = handle
                    .child_id
                    .and_then(|id| self.workers.get(&id))
                    .filter(|worker| worker.is_started());
                match owner {
                    Some(worker) => worker.control_into(Target::Handle(handle), args, reply),
                    None => {
                        let _ = reply.send(Err(unknown_handle(&handle)));
                    }
                }
            }
            Command::Broadcast {
                method,
                args,
                reply,
            } => {
                let acks = self
                    .workers
                    .values()
                    .filter(|worker| worker.is_ready())
                    .map(|worker| (worker.id(), worker.control(Target::method(method), args.clone())))
                    .collect();
                let _ = reply.send(acks);
            }
            Command::WorkerStarted(id) => self.initialize_worker(id),
            Command::WorkerReady(id) => {
                if let Some(worker) = self.workers.get(&id) {
                    if worker.advance(WorkerState::Ready) {
                        info!(child_id = %id, "Worker ready");
                        self.startup_failures = 0;
                    }
                }
                self.process_queue();
            }
            Command::WorkerStartFailed { id, error } => {
                warn!(child_id = %id, %error, "Worker failed to start");
                self.stop_worker(id, &error);
                self.workers.remove(&id);
                self.startup_failures += 1;
                if self.startup_failures > self.options.max_call_retries {
                    warn!(
                        failures = self.startup_failures,
                        queued = self.queue.len(),
                        "Workers keep failing to start, rejecting queued calls"
                    );
                    for call in self.queue.drain(..) {
                        call.settle(Err(FarmError::WorkerStartup(error.clone())));
                    }
                    self.startup_failures = 0;
                }
                self.process_queue();
            }
            Command::WorkerFailed { id, error } => {
                self.stop_worker(id, &error);
                self.process_queue();
            }
            Command::WorkerExited { id, code } => {
                if let Some(worker) = self.workers.get(&id) {
                    if !worker.is_stopping() {
                        warn!(child_id = %id, ?code, "Worker exited unexpectedly");
                    }
                }
                self.stop_worker(id, "worker exited");
                self.workers.remove(&id);
                self.check_drained().await;
                self.process_queue();
            }
            Command::CallSettled(_) => {
                self.check_drained().await;
                self.process_queue();
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::End(reply) => {
                if let Some(reply) = reply {
                    self.end_waiters.push(reply);
                }
                self.begin_end().await;
            }
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn process_queue(&mut self) {
        if self.phase != Phase::Running || self.queue.is_empty() {
            return;
        }
        if self.options.allows_remote_workers() && self.live_workers() < self.options.max_concurrent_workers {
            self.start_worker();
        }

        let cap = self.options.max_concurrent_calls_per_worker;
        while !self.queue.is_empty() {
            // Least busy ready worker with spare capacity; cold workers win ties
            let Some(worker) = self
                .workers
                .values()
                .filter(|worker| worker.is_ready())
                .map(|worker| (worker.inflight_calls(), worker))
                .filter(|(inflight, _)| *inflight < cap)
                .min_by_key(|(inflight, worker)| (*inflight, worker.is_warm()))
                .map(|(_, worker)| worker.clone())
            else {
                break;
            };
            let Some(call) = self.queue.pop_front() else {
                break;
            };
            if let Err(call) = worker.call(call) {
                self.queue.push_front(call);
                self.stop_worker(worker.id(), "send failed");
            }
        }
    }

    /// Put a call from a failed worker back at the front of the queue
    fn requeue(&mut self, mut call: Call, reason: &str) {
        if call.warmup {
            return;
        }
        call.retries += 1;
        if self.phase != Phase::Running {
            call.settle(Err(FarmError::Ending));
            return;
        }
        if call.retries > self.options.max_call_retries {
            warn!(method = %call.method, retries = call.retries, %reason, "Giving up on call");
            let method = call.method.clone();
            let retries = call.retries - 1;
            call.settle(Err(FarmError::RetriesExhausted {
                method,
                retries,
                reason: reason.to_string(),
            }));
            return;
        }
        debug!(method = %call.method, retries = call.retries, "Requeueing call");
        self.queue.push_front(call);
    }

    fn live_workers(&self) -> usize {
        self.workers.values().filter(|worker| !worker.is_stopping()).count()
    }

    fn inflight_calls(&self) -> usize {
        self.workers.values().map(|worker| worker.inflight_calls()).sum()
    }

    fn refresh_gauges(&self) {
        let live = self.live_workers();
        let warm = self
            .workers
            .values()
            .filter(|worker| worker.is_ready() && worker.is_warm())
            .count();
        self.gauges.pool_size.store(live, Ordering::Relaxed);
        self.gauges.warm_workers.store(warm, Ordering::Relaxed);
    }

    fn stats(&self) -> FarmStats {
        FarmStats {
            backend: self.factory.kind(),
            workers: self.live_workers(),
            ready_workers: self.workers.values().filter(|w| w.is_ready()).count(),
            warm_workers: self
                .workers
                .values()
                .filter(|w| w.is_ready() && w.is_warm())
                .count(),
            queued_calls: self.queue.len(),
            inflight_calls: self.inflight_calls(),
            shared_references: self.services.shared.read().len(),
            handles: self.services.handles.len(),
        }
    }

    // =========================================================================
    // Worker lifecycle
    // =========================================================================

    #[instrument(skip(self))]
    fn start_worker(&mut self) {
        self.next_child_id += 1;
        let id = ChildId(self.next_child_id);

        let (events, events_rx) = mpsc::unbounded_channel();
        let backend = self.factory.create(BackendContext {
            child_id: id,
            worker_path: self.worker_path.clone(),
            registry: self.registry.clone(),
            executable: self.options.child_executable.clone(),
            forced_kill_time: self.options.forced_kill_time,
            events,
        });
        let worker = Worker::new(id, backend);
        self.workers.insert(id, worker.clone());
        tokio::spawn(pump(Arc::downgrade(&worker), events_rx, self.services.clone()));
        debug!(child_id = %id, backend = %self.factory.kind(), "Starting worker");

        let services = self.services.clone();
        tokio::spawn(async move {
            match worker.backend().start().await {
                Ok(()) if worker.is_stopping() => {
                    // Stopped while starting; the earlier stop found nothing to stop
                    let _ = worker.backend().stop().await;
                }
                Ok(()) => {
                    services.send(Command::WorkerStarted(id));
                }
                Err(e) => {
                    services.send(Command::WorkerStartFailed {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Load the module and replicate shared references, then report ready
    fn initialize_worker(&mut self, id: ChildId) {
        let Some(worker) = self.workers.get(&id).cloned() else {
            return;
        };
        if !worker.advance(WorkerState::Initializing) {
            return;
        }

        let init = worker.control(
            Target::method(methods::CHILD_INIT),
            vec![
                json!(self.worker_path),
                json!(id),
                json!(self.options.should_trace),
            ],
        );
        let replicas: Vec<_> = self
            .services
            .shared
            .read()
            .entries()
            .into_iter()
            .map(|(shared_ref, value)| {
                worker.mark_shared_reference_sent(shared_ref);
                worker.control(
                    Target::method(methods::CREATE_SHARED_REFERENCE),
                    vec![json!(shared_ref), value],
                )
            })
            .collect();

        let services = self.services.clone();
        tokio::spawn(async move {
            let mut result = acked(init.await);
            for replica in replicas {
                if result.is_err() {
                    break;
                }
                result = acked(replica.await);
            }
            let command = match result {
                Ok(()) => Command::WorkerReady(id),
                Err(diagnostic) => Command::WorkerStartFailed {
                    id,
                    error: diagnostic.to_string(),
                },
            };
            services.send(command);
        });
    }

    /// Stop a worker and requeue its calls; the worker stays listed until it exits
    fn stop_worker(&mut self, id: ChildId, reason: &str) {
        let Some(worker) = self.workers.get(&id).cloned() else {
            return;
        };
        if !worker.begin_stopping() {
            return;
        }
        debug!(child_id = %id, %reason, "Stopping worker");

        // Reverse so that push_front keeps the original dispatch order
        for call in worker.take_inflight_calls(reason).into_iter().rev() {
            self.requeue(call, reason);
        }

        let services = self.services.clone();
        tokio::spawn(async move {
            worker.stop().await;
            // The backend may never have started, in which case it reports no exit
            services.send(Command::WorkerExited { id, code: None });
        });
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn begin_end(&mut self) {
        match self.phase {
            Phase::Ended => {
                for waiter in self.end_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                return;
            }
            Phase::Draining => return,
            Phase::Running => {}
        }

        info!(queued = self.queue.len(), inflight = self.inflight_calls(), "Ending worker farm");
        self.gauges.ending.store(true, Ordering::SeqCst);
        self.phase = Phase::Draining;
        for call in self.queue.drain(..) {
            call.settle(Err(FarmError::Ending));
        }
        self.drain_deadline = Some(Instant::now() + self.options.drain_timeout);
        self.check_drained().await;
    }

    async fn check_drained(&mut self) {
        if self.phase == Phase::Draining && self.inflight_calls() == 0 {
            self.finish().await;
        }
    }

    /// Stop every worker and clear the farm's state
    async fn finish(&mut self) {
        self.gauges.ending.store(true, Ordering::SeqCst);
        self.phase = Phase::Ended;
        self.drain_deadline = None;

        let workers: Vec<Arc<Worker>> = std::mem::take(&mut self.workers).into_values().collect();
        for worker in &workers {
            worker.begin_stopping();
            for call in worker.take_inflight_calls("worker farm ended") {
                call.settle(Err(FarmError::Ending));
            }
        }
        for call in self.queue.drain(..) {
            call.settle(Err(FarmError::Ending));
        }
        join_all(workers.iter().map(|worker| worker.stop())).await;

        self.services.handles.clear();
        self.services.shared.write().clear();
        self.gauges.pool_size.store(0, Ordering::Relaxed);
        self.gauges.warm_workers.store(0, Ordering::Relaxed);

        info!(workers = workers.len(), "Worker farm ended");
        for waiter in self.end_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn acked(
    reply: Result<Result<Value, Diagnostic>, oneshot::error::RecvError>,
) -> Result<(), Diagnostic> {
    match reply {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(diagnostic)) => Err(diagnostic),
        Err(_) => Err(Diagnostic::new("worker went away during startup")),
    }
}
