//! The farm controller.
//!
//! All pool state (call queue, worker table, timers, shutdown marker) is
//! owned by one controller thread and mutated only while handling a single
//! event. Callers talk to it through a [`FarmHandle`]; workers through their
//! event streams. The only state shared with caller threads is the admitted
//! call counter and the ending flag, both atomics checked at admission.
//!
//! ```text
//!   callers ──Submit/End/Introspect──▶ mailbox ─┐
//!   starter threads ──WorkerStarted/Failed────▶ │
//!                                               ▼
//!   worker events ──────────────────────▶ controller ──▶ callback executor
//!                                               │
//!                                               └──ControlMessage──▶ workers
//! ```

mod call;
mod timer;

pub use call::{CallResult, Callback, ShutdownCallback};
pub(crate) use call::Call;

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::worker::protocol::{WorkerId, WorkerMessage, decode_outcome};
use crate::worker::signals::TerminationReason;
use crate::worker::{
    InitOptions, ProcessSpawner, Spawned, Spawner, ThreadSpawner, WorkerEvent, WorkerHandle,
    WorkerInfo,
};
use call::CallbackExecutor;
use crossbeam_channel::{Receiver, Select, Sender, bounded, unbounded};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use timer::{TimerKind, TimerQueue};

/// Delay between a worker's exit and requeueing its calls, so results
/// already on their way are still received.
pub const SETTLE_WINDOW: Duration = Duration::from_millis(10);

/// Delay before dispatching again after a worker failed to start.
pub const START_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Snapshot of a farm's load.
///
/// Serialises flat, as `{"total":3,"0":2,"1":1}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// In-flight plus queued calls.
    pub total: usize,
    /// In-flight calls per worker.
    pub workers: BTreeMap<WorkerId, usize>,
}

impl Serialize for QueueInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.workers.len() + 1))?;
        map.serialize_entry("total", &self.total)?;
        for (id, active) in &self.workers {
            map.serialize_entry(&id.to_string(), active)?;
        }
        map.end()
    }
}

enum FarmEvent {
    Submit(Call),
    End(Option<ShutdownCallback>),
    Introspect(Sender<QueueInfo>),
    AutoStart(Sender<Result<()>>),
    WorkerStarted(WorkerId, Spawned),
    WorkerStartFailed(WorkerId, FarmError),
    /// The last handle was dropped.
    Detach,
}

/// Shutdown progress.
enum Ending {
    NotEnding,
    /// Ending with nobody to notify.
    Silent,
    WithCallbacks(Vec<ShutdownCallback>),
    Finished,
}

impl Ending {
    fn is_ending(&self) -> bool {
        matches!(self, Self::Silent | Self::WithCallbacks(_))
    }
}

enum WorkerState {
    Running,
    /// A call timed out; the worker is being torn down.
    Untrusted,
    Exited(TerminationReason),
}

struct Worker {
    handle: Box<dyn WorkerHandle>,
    events: Receiver<WorkerEvent>,
    info: WorkerInfo,
    /// In-flight calls by slot.
    calls: BTreeMap<usize, Call>,
    /// Next slot index; also the number of calls ever assigned.
    next_slot: usize,
    state: WorkerState,
    /// Still read after an exit: results may trail it until the worker settles.
    events_open: bool,
}

/// Startup of the full pool requested by `auto_start`.
struct InitialStart {
    remaining: usize,
    reply: Sender<Result<()>>,
}

/// Advance the round-robin dispatch cursor over `len` workers.
fn advance_cursor(cursor: isize, len: usize) -> isize {
    if cursor >= len as isize - 1 { 0 } else { cursor + 1 }
}

/// Count one more admitted call unless that would exceed `limit`.
///
/// On rejection returns the number of calls already admitted.
fn try_admit(admitted: &AtomicUsize, limit: Option<usize>) -> std::result::Result<(), usize> {
    match limit {
        Some(limit) => admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ()),
        None => {
            admitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

/// Caller-side handle to a running farm.
///
/// Dropping it detaches the controller, which shuts the farm down silently
/// if nobody asked for a shutdown yet.
pub(crate) struct FarmHandle {
    mailbox: Sender<FarmEvent>,
    admitted: Arc<AtomicUsize>,
    ending: Arc<AtomicBool>,
    max_concurrent_calls: Option<usize>,
}

impl FarmHandle {
    /// Start a farm serving `module`. Blocks until the whole pool is up when
    /// `auto_start` is set.
    pub fn launch(config: FarmConfig, module: String) -> Result<Self> {
        config.validate()?;

        let spawner: Arc<dyn Spawner> = match (&config.registry, config.enable_worker_threads) {
            (Some(registry), true) => Arc::new(ThreadSpawner::new(
                Arc::clone(registry),
                &config.worker_options,
            )),
            _ => Arc::new(ProcessSpawner::new(&config.worker_options)?),
        };

        Self::launch_with(config, module, spawner)
    }

    fn launch_with(config: FarmConfig, module: String, spawner: Arc<dyn Spawner>) -> Result<Self> {
        let (executor, _) = CallbackExecutor::spawn("farm-callbacks")?;
        let (mailbox_tx, mailbox_rx) = unbounded();
        let admitted = Arc::new(AtomicUsize::new(0));
        let ending = Arc::new(AtomicBool::new(false));

        let handle = FarmHandle {
            mailbox: mailbox_tx.clone(),
            admitted: Arc::clone(&admitted),
            ending: Arc::clone(&ending),
            max_concurrent_calls: config.max_concurrent_calls,
        };

        let auto_start = config.auto_start;
        let farm = Farm {
            init: config.init_options(),
            config,
            module,
            spawner,
            mailbox: mailbox_tx,
            executor,
            admitted,
            ending_flag: ending,
            queue: VecDeque::new(),
            workers: BTreeMap::new(),
            next_worker_id: 0,
            starting: 0,
            active_calls: 0,
            cursor: -1,
            ending: Ending::NotEnding,
            timers: TimerQueue::new(),
            initial: None,
            detached: false,
        };

        thread::Builder::new()
            .name("farm-controller".to_string())
            .spawn(move || farm.run(mailbox_rx))?;

        if auto_start {
            let (reply_tx, reply_rx) = bounded(1);
            handle.send(FarmEvent::AutoStart(reply_tx));
            reply_rx.recv().unwrap_or_else(|_| {
                Err(FarmError::WorkerInit("farm controller stopped".into()))
            })?;
        }

        Ok(handle)
    }

    fn send(&self, event: FarmEvent) -> bool {
        self.mailbox.send(event).is_ok()
    }

    /// Admit a call and hand it to the controller.
    ///
    /// Rejections invoke the call's continuation right here on the caller's
    /// thread.
    pub fn add_call(&self, call: Call) {
        if self.ending.load(Ordering::SeqCst) {
            (call.callback)(Err(FarmError::ShuttingDown));
            return;
        }

        if let Err(in_flight) = try_admit(&self.admitted, self.max_concurrent_calls) {
            let limit = self.max_concurrent_calls.unwrap_or(in_flight);
            (call.callback)(Err(FarmError::MaxConcurrentCalls(format!(
                "Too many concurrent calls (in flight: {}, limit: {})",
                in_flight, limit
            ))));
            return;
        }

        if let Err(e) = self.mailbox.send(FarmEvent::Submit(call)) {
            self.admitted.fetch_sub(1, Ordering::SeqCst);
            if let FarmEvent::Submit(call) = e.into_inner() {
                (call.callback)(Err(FarmError::ShuttingDown));
            }
        }
    }

    /// Begin shutdown. `callback` fires once every worker has stopped.
    pub fn end(&self, callback: Option<ShutdownCallback>) {
        self.ending.store(true, Ordering::SeqCst);
        if let Err(e) = self.mailbox.send(FarmEvent::End(callback)) {
            // Controller already finished
            if let FarmEvent::End(Some(callback)) = e.into_inner() {
                callback();
            }
        }
    }

    pub fn queue_info(&self) -> QueueInfo {
        let (tx, rx) = bounded(1);
        if !self.send(FarmEvent::Introspect(tx)) {
            return QueueInfo::default();
        }
        rx.recv().unwrap_or_default()
    }
}

impl Drop for FarmHandle {
    fn drop(&mut self) {
        self.send(FarmEvent::Detach);
    }
}

/// Controller state. Lives on the controller thread.
struct Farm {
    config: FarmConfig,
    init: InitOptions,
    module: String,
    spawner: Arc<dyn Spawner>,
    /// For starter threads to report back.
    mailbox: Sender<FarmEvent>,
    executor: CallbackExecutor,
    admitted: Arc<AtomicUsize>,
    ending_flag: Arc<AtomicBool>,

    queue: VecDeque<Call>,
    workers: BTreeMap<WorkerId, Worker>,
    next_worker_id: WorkerId,
    starting: usize,
    active_calls: usize,
    cursor: isize,
    ending: Ending,
    timers: TimerQueue,
    initial: Option<InitialStart>,
    detached: bool,
}

impl Farm {
    fn run(mut self, mailbox: Receiver<FarmEvent>) {
        tracing::debug!(module = %self.module, "Farm controller started");

        while !(self.detached && matches!(self.ending, Ending::Finished)) {
            let now = Instant::now();
            while let Some(kind) = self.timers.pop_due(now) {
                self.on_timer(kind);
            }

            let streams: Vec<(WorkerId, Receiver<WorkerEvent>)> = self
                .workers
                .iter()
                .filter(|(_, w)| w.events_open)
                .map(|(id, w)| (*id, w.events.clone()))
                .collect();

            let mut select = Select::new();
            select.recv(&mailbox);
            for (_, events) in &streams {
                select.recv(events);
            }

            let oper = match self.timers.next_deadline() {
                Some(deadline) => match select.select_deadline(deadline) {
                    Ok(oper) => oper,
                    Err(_) => continue,
                },
                None => select.select(),
            };

            match oper.index() {
                0 => match oper.recv(&mailbox) {
                    Ok(event) => self.on_event(event),
                    // Unreachable while we hold a sender
                    Err(_) => break,
                },
                i => {
                    let (id, events) = &streams[i - 1];
                    match oper.recv(events) {
                        Ok(event) => self.on_worker_event(*id, event),
                        Err(_) => self.on_disconnected(*id),
                    }
                }
            }
        }

        tracing::debug!(module = %self.module, "Farm controller stopped");
    }

    fn on_event(&mut self, event: FarmEvent) {
        match event {
            FarmEvent::Submit(call) => self.add_call(call),
            FarmEvent::End(callback) => self.end(callback),
            FarmEvent::Introspect(reply) => {
                let _ = reply.send(self.queue_info());
            }
            FarmEvent::AutoStart(reply) => self.auto_start(reply),
            FarmEvent::WorkerStarted(id, spawned) => self.on_started(id, spawned),
            FarmEvent::WorkerStartFailed(id, err) => self.on_start_failed(id, err),
            FarmEvent::Detach => {
                self.detached = true;
                if matches!(self.ending, Ending::NotEnding) {
                    tracing::debug!("All farm handles dropped, shutting down");
                    self.end(None);
                }
            }
        }
    }

    fn on_worker_event(&mut self, id: WorkerId, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(WorkerMessage::Result {
                idx,
                worker_id,
                args,
            }) => {
                if worker_id != id {
                    tracing::warn!(worker_id = id, claimed = worker_id, idx, "Result names another worker");
                }
                self.receive(worker_id, idx, args);
            }
            WorkerEvent::Message(WorkerMessage::Ready) => {
                tracing::trace!(worker_id = id, "Ignoring ready signal outside handshake");
            }
            WorkerEvent::Exited(reason) => self.on_exit(id, reason),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::CallTimeout(id) => self.child_timeout(id),
            TimerKind::Settle(id) => self.settle(id),
            TimerKind::RetryDispatch => self.process_queue(),
        }
    }

    fn complete(&mut self, call: Call, result: CallResult) {
        self.admitted.fetch_sub(1, Ordering::SeqCst);
        self.executor.complete(call.callback, result);
    }

    fn add_call(&mut self, call: Call) {
        if !matches!(self.ending, Ending::NotEnding) {
            self.complete(call, Err(FarmError::ShuttingDown));
            return;
        }
        self.queue.push_back(call);
        self.process_queue();
    }

    fn auto_start(&mut self, reply: Sender<Result<()>>) {
        let wanted = self
            .config
            .max_concurrent_workers
            .saturating_sub(self.workers.len() + self.starting);
        if wanted == 0 {
            let _ = reply.send(Ok(()));
            return;
        }
        tracing::debug!(workers = wanted, "Starting worker pool");
        self.initial = Some(InitialStart {
            remaining: wanted,
            reply,
        });
        for _ in 0..wanted {
            self.start_worker();
        }
    }

    fn start_worker(&mut self) {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.starting += 1;

        let spawner = Arc::clone(&self.spawner);
        let module = self.module.clone();
        let init = self.init.clone();
        let mailbox = self.mailbox.clone();

        let spawned = thread::Builder::new()
            .name(format!("farm-starter-{}", id))
            .spawn(move || {
                let event = match spawner.start(id, &module, &init) {
                    Ok(spawned) => FarmEvent::WorkerStarted(id, spawned),
                    Err(e) => FarmEvent::WorkerStartFailed(id, e),
                };
                let _ = mailbox.send(event);
            });

        if let Err(e) = spawned {
            self.on_start_failed(
                id,
                FarmError::WorkerInit(format!("Failed to spawn starter thread: {}", e)),
            );
        }
    }

    fn on_started(&mut self, id: WorkerId, spawned: Spawned) {
        self.starting -= 1;
        let Spawned {
            handle,
            events,
            info,
        } = spawned;

        tracing::debug!(worker_id = id, pid = ?info.pid, thread = ?info.thread_name, "Worker started");

        if let Some(hook) = &self.config.on_worker_started
            && catch_unwind(AssertUnwindSafe(|| hook(&info))).is_err()
        {
            tracing::error!(worker_id = id, "Worker-started hook panicked");
        }

        self.workers.insert(
            id,
            Worker {
                handle,
                events,
                info,
                calls: BTreeMap::new(),
                next_slot: 0,
                state: WorkerState::Running,
                events_open: true,
            },
        );

        let pool_ready = match &mut self.initial {
            Some(initial) => {
                initial.remaining -= 1;
                initial.remaining == 0
            }
            None => false,
        };
        if pool_ready && let Some(initial) = self.initial.take() {
            tracing::debug!("Worker pool ready");
            let _ = initial.reply.send(Ok(()));
        }

        self.process_queue();
    }

    fn on_start_failed(&mut self, id: WorkerId, err: FarmError) {
        self.starting -= 1;

        if let Some(initial) = self.initial.take() {
            tracing::error!(worker_id = id, error = %err, "Failed to start worker pool");
            let _ = initial.reply.send(Err(err));
            self.end(None);
            return;
        }

        tracing::error!(worker_id = id, error = %err, "Failed to start worker");

        if !self.queue.is_empty() {
            self.timers
                .schedule(START_RETRY_DELAY, TimerKind::RetryDispatch);
        } else if self.ending.is_ending() {
            self.end_check();
        }
    }

    /// Dispatch queued calls to eligible workers, starting a worker if the
    /// pool has room.
    fn process_queue(&mut self) {
        if self.queue.is_empty() {
            self.end_check();
            return;
        }

        if self.workers.len() + self.starting < self.config.max_concurrent_workers {
            self.start_worker();
        }

        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        self.cursor = advance_cursor(self.cursor, ids.len());
        ids.rotate_left(self.cursor as usize);

        for id in ids {
            if !self.is_eligible(id) {
                continue;
            }
            let Some(call) = self.queue.pop_front() else {
                break;
            };
            self.send(id, call);
            if self.queue.is_empty() {
                break;
            }
        }

        self.end_check();
    }

    fn is_eligible(&self, id: WorkerId) -> bool {
        self.workers.get(&id).is_some_and(|w| {
            matches!(w.state, WorkerState::Running)
                && w.calls.len() < self.config.max_concurrent_calls_per_worker
                && self
                    .config
                    .max_calls_per_worker
                    .is_none_or(|max| w.next_slot < max)
        })
    }

    fn send(&mut self, id: WorkerId, mut call: Call) {
        let max_call_time = call.max_call_time.or(self.config.max_call_time);
        let Some(worker) = self.workers.get_mut(&id) else {
            self.queue.push_front(call);
            return;
        };

        let idx = worker.next_slot;
        worker.next_slot += 1;

        let message = crate::worker::protocol::ControlMessage::call(
            idx,
            id,
            call.method.clone(),
            call.args.clone(),
        );
        if let Err(e) = worker.handle.send(message) {
            // The worker's exit will requeue the call
            tracing::debug!(worker_id = id, idx, error = %e, "Failed to send call");
        }

        call.timer = max_call_time.map(|t| self.timers.schedule(t, TimerKind::CallTimeout(id)));
        tracing::trace!(worker_id = id, idx, method = ?call.method, "Dispatched call");
        worker.calls.insert(idx, call);
        self.active_calls += 1;
    }

    fn receive(&mut self, id: WorkerId, idx: usize, args: Vec<serde_json::Value>) {
        let Some(worker) = self.workers.get_mut(&id) else {
            tracing::warn!(
                worker_id = id,
                idx,
                "Received result for unknown worker; its calls were requeued or failed"
            );
            return;
        };
        let Some(call) = worker.calls.remove(&idx) else {
            tracing::warn!(worker_id = id, idx, "Received result for unknown call slot");
            return;
        };

        let retired = worker.calls.is_empty()
            && self
                .config
                .max_calls_per_worker
                .is_some_and(|max| worker.next_slot >= max);

        if let Some(timer) = call.timer {
            self.timers.cancel(timer);
        }
        self.active_calls -= 1;

        let result = decode_outcome(args).map_err(FarmError::Remote);
        self.complete(call, result);

        if retired {
            tracing::debug!(worker_id = id, "Worker reached its call quota");
            self.stop_worker(id);
        }
        self.process_queue();
    }

    fn child_timeout(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        worker.state = WorkerState::Untrusted;
        let calls = std::mem::take(&mut worker.calls);

        tracing::warn!(worker_id = id, calls = calls.len(), "Worker call timed out");

        for (_, call) in calls {
            if let Some(timer) = call.timer {
                self.timers.cancel(timer);
            }
            self.active_calls -= 1;
            self.complete(call, Err(FarmError::Timeout("worker call timed out!".into())));
        }

        self.stop_worker(id);
        self.process_queue();
    }

    fn on_disconnected(&mut self, id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.events_open = false;
        }
        self.on_exit(id, TerminationReason::Unknown);
    }

    fn on_exit(&mut self, id: WorkerId, reason: TerminationReason) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        if matches!(worker.state, WorkerState::Exited(_)) {
            return;
        }
        if worker.calls.is_empty() {
            tracing::debug!(worker_id = id, %reason, "Worker exited");
        } else {
            tracing::warn!(worker_id = id, %reason, calls = worker.calls.len(), "Worker died with calls in flight");
        }
        worker.state = WorkerState::Exited(reason);
        self.timers.schedule(SETTLE_WINDOW, TimerKind::Settle(id));
    }

    /// Requeue or fail what an exited worker still held, then drop it.
    fn settle(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        let calls = std::mem::take(&mut worker.calls);

        let mut requeued = Vec::new();
        for (_, mut call) in calls {
            if let Some(timer) = call.timer.take() {
                self.timers.cancel(timer);
            }
            self.active_calls -= 1;

            if self
                .config
                .max_retries
                .is_some_and(|max| call.retries >= max)
            {
                let message = format!("cancel after {} retries!", call.retries);
                self.complete(call, Err(FarmError::ProcessTerminated(message)));
            } else {
                call.retries += 1;
                requeued.push(call);
            }
        }

        self.stop_worker(id);

        if requeued.is_empty() {
            self.end_check();
            return;
        }
        tracing::debug!(worker_id = id, calls = requeued.len(), "Requeueing calls of dead worker");
        for call in requeued.into_iter().rev() {
            self.queue.push_front(call);
        }
        self.process_queue();
    }

    /// Remove a worker from the table and let it go.
    fn stop_worker(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.remove(&id) else {
            return;
        };
        match worker.state {
            WorkerState::Exited(_) => {}
            WorkerState::Running | WorkerState::Untrusted => {
                tracing::debug!(worker_id = id, pid = ?worker.info.pid, "Stopping worker");
                worker.handle.stop_with_timeout(self.config.forced_kill_time);
            }
        }
    }

    fn end(&mut self, callback: Option<ShutdownCallback>) {
        self.ending_flag.store(true, Ordering::SeqCst);

        if matches!(self.ending, Ending::Finished) {
            if let Some(callback) = callback {
                self.executor.execute(callback);
            }
            return;
        }

        match callback {
            Some(callback) => match &mut self.ending {
                Ending::WithCallbacks(callbacks) => callbacks.push(callback),
                ending => *ending = Ending::WithCallbacks(vec![callback]),
            },
            None => {
                if matches!(self.ending, Ending::NotEnding) {
                    self.ending = Ending::Silent;
                }
            }
        }

        self.end_check();
    }

    /// While ending: stop idle workers and finish once nothing is left.
    fn end_check(&mut self) {
        if !self.ending.is_ending() {
            return;
        }

        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.calls.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.stop_worker(id);
        }

        if self.workers.is_empty() && self.starting == 0 && self.queue.is_empty() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let callbacks = match std::mem::replace(&mut self.ending, Ending::Finished) {
            Ending::WithCallbacks(callbacks) => callbacks,
            _ => Vec::new(),
        };
        tracing::debug!(callbacks = callbacks.len(), "Farm shut down");
        for callback in callbacks {
            self.executor.execute(callback);
        }
    }

    fn queue_info(&self) -> QueueInfo {
        QueueInfo {
            total: self.active_calls + self.queue.len(),
            workers: self
                .workers
                .iter()
                .map(|(id, w)| (*id, w.calls.len()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::ControlMessage;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    const WAIT: Duration = Duration::from_secs(10);

    /// Test side of a worker launched by [`ScriptedSpawner`].
    struct ScriptedWorker {
        control: Receiver<ControlMessage>,
        events: Sender<WorkerEvent>,
    }

    impl ScriptedWorker {
        /// Next call sent to this worker, skipping the load message.
        fn next_call(&self) -> (usize, WorkerId) {
            loop {
                match self.control.recv_timeout(WAIT).unwrap() {
                    ControlMessage::Call { idx, worker_id, .. } => return (idx, worker_id),
                    ControlMessage::Load { .. } => continue,
                    ControlMessage::Die => panic!("worker stopped while a call was expected"),
                }
            }
        }

        fn answer(&self, idx: usize, worker_id: WorkerId, value: Value) {
            let message = WorkerMessage::result(idx, worker_id, Ok(vec![value]));
            self.events.send(WorkerEvent::Message(message)).unwrap();
        }
    }

    struct ScriptedHandle {
        control: Sender<ControlMessage>,
    }

    impl WorkerHandle for ScriptedHandle {
        fn send(&self, message: ControlMessage) -> Result<()> {
            self.control
                .send(message)
                .map_err(|_| FarmError::WorkerInit("scripted worker gone".into()))
        }

        fn stop_with_timeout(self: Box<Self>, _grace: Duration) {
            let _ = self.control.send(ControlMessage::Die);
        }
    }

    /// Hands each launched worker to the test; refuses launches past `capacity`.
    struct ScriptedSpawner {
        launched: Sender<ScriptedWorker>,
        attempts: Arc<AtomicUsize>,
        capacity: usize,
    }

    impl Spawner for ScriptedSpawner {
        fn launch(&self, id: WorkerId) -> Result<Spawned> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.capacity {
                return Err(FarmError::WorkerInit("no capacity left".into()));
            }
            let (control_tx, control_rx) = unbounded();
            let (events_tx, events_rx) = unbounded();
            let _ = self.launched.send(ScriptedWorker {
                control: control_rx,
                events: events_tx,
            });
            Ok(Spawned {
                handle: Box::new(ScriptedHandle {
                    control: control_tx,
                }),
                events: events_rx,
                info: WorkerInfo {
                    id,
                    pid: None,
                    thread_name: None,
                },
            })
        }
    }

    fn scripted_farm(
        config: FarmConfig,
        capacity: usize,
    ) -> (FarmHandle, Receiver<ScriptedWorker>, Arc<AtomicUsize>) {
        let (launched_tx, launched_rx) = unbounded();
        let attempts = Arc::new(AtomicUsize::new(0));
        let spawner = Arc::new(ScriptedSpawner {
            launched: launched_tx,
            attempts: Arc::clone(&attempts),
            capacity,
        });
        let farm = FarmHandle::launch_with(config, "scripted".into(), spawner).unwrap();
        (farm, launched_rx, attempts)
    }

    fn submit(farm: &FarmHandle, results: &Sender<CallResult>) {
        let results = results.clone();
        farm.add_call(Call::new(
            None,
            vec![],
            Box::new(move |result| {
                let _ = results.send(result);
            }),
        ));
    }

    #[test]
    fn test_failed_start_leaves_surviving_worker_serving() {
        let config = FarmConfig::new()
            .with_max_concurrent_workers(2)
            .with_max_concurrent_calls_per_worker(1);
        let (farm, launched, attempts) = scripted_farm(config, 1);
        let (results_tx, results_rx) = unbounded();
        for _ in 0..3 {
            submit(&farm, &results_tx);
        }

        let worker = launched.recv_timeout(WAIT).unwrap();
        for i in 0..3 {
            let (idx, worker_id) = worker.next_call();
            assert_eq!(worker_id, 0);
            worker.answer(idx, worker_id, json!(i));
            assert_eq!(results_rx.recv_timeout(WAIT).unwrap().unwrap(), vec![json!(i)]);
        }

        let deadline = Instant::now() + WAIT;
        while attempts.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(launched.try_recv().is_err());

        let (done_tx, done_rx) = bounded(1);
        farm.end(Some(Box::new(move || {
            let _ = done_tx.send(());
        })));
        done_rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_result_trailing_exit_is_not_retried() {
        let config = FarmConfig::new().with_max_concurrent_workers(1);
        let (farm, launched, attempts) = scripted_farm(config, usize::MAX);
        let (results_tx, results_rx) = unbounded();
        submit(&farm, &results_tx);

        let worker = launched.recv_timeout(WAIT).unwrap();
        let (idx, worker_id) = worker.next_call();
        worker
            .events
            .send(WorkerEvent::Exited(TerminationReason::Panicked))
            .unwrap();
        worker
            .events
            .send(WorkerEvent::Exited(TerminationReason::Panicked))
            .unwrap();
        worker.answer(idx, worker_id, json!("late"));

        assert_eq!(
            results_rx.recv_timeout(WAIT).unwrap().unwrap(),
            vec![json!("late")]
        );
        thread::sleep(SETTLE_WINDOW * 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(results_rx.try_recv().is_err());
        drop(farm);
    }

    #[test]
    fn test_cursor_wraps() {
        assert_eq!(advance_cursor(-1, 0), 0);
        assert_eq!(advance_cursor(-1, 3), 0);
        assert_eq!(advance_cursor(0, 3), 1);
        assert_eq!(advance_cursor(1, 3), 2);
        assert_eq!(advance_cursor(2, 3), 0);
        // Pool shrank under the cursor
        assert_eq!(advance_cursor(5, 2), 0);
    }

    #[test]
    fn test_admission_limit() {
        let admitted = AtomicUsize::new(0);
        assert!(try_admit(&admitted, Some(2)).is_ok());
        assert!(try_admit(&admitted, Some(2)).is_ok());
        assert_eq!(try_admit(&admitted, Some(2)), Err(2));
        admitted.fetch_sub(1, Ordering::SeqCst);
        assert!(try_admit(&admitted, Some(2)).is_ok());

        let unbounded = AtomicUsize::new(0);
        for _ in 0..1000 {
            assert!(try_admit(&unbounded, None).is_ok());
        }
        assert_eq!(unbounded.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_queue_info_serialises_flat() {
        let info = QueueInfo {
            total: 3,
            workers: BTreeMap::from([(0, 2), (4, 1)]),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"total": 3, "0": 2, "4": 1}));

        let empty = serde_json::to_value(QueueInfo::default()).unwrap();
        assert_eq!(empty, serde_json::json!({"total": 0}));
    }

    proptest! {
        #[test]
        fn prop_cursor_visits_every_worker(len in 1usize..16, start in -1isize..16) {
            let mut cursor = advance_cursor(start, len);
            let mut seen = vec![false; len];
            for _ in 0..len {
                prop_assert!(cursor >= 0 && (cursor as usize) < len);
                seen[cursor as usize] = true;
                cursor = advance_cursor(cursor, len);
            }
            prop_assert!(seen.iter().all(|s| *s));
        }

        #[test]
        fn prop_admission_never_exceeds_limit(limit in 1usize..50, attempts in 0usize..200) {
            let admitted = AtomicUsize::new(0);
            let accepted = (0..attempts)
                .filter(|_| try_admit(&admitted, Some(limit)).is_ok())
                .count();
            prop_assert_eq!(accepted, attempts.min(limit));
            prop_assert_eq!(admitted.load(Ordering::SeqCst), attempts.min(limit));
        }
    }
}
