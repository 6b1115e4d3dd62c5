//! Worker-pool processing nodes.
//!
//! A [`Node`] drives a user-supplied processing function over one input
//! queue with a pool of cooperating workers, fanning results out to
//! downstream nodes under optional predicates. Failures are quarantined
//! as [`NodeFailure`] values once the retry budget is exhausted, and
//! end-of-stream is detected by worker zero once every upstream node has
//! stopped and the input queue has drained.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::TRACING_TARGET;
use crate::error::{BoxError, Error, NodeFailure, Result};
use crate::monitor::NodeMetrics;
use crate::queue::{Queue, Signal};
use crate::retry::RetryPolicy;

/// A value that can travel through the flow runtime.
///
/// `label` feeds the executing list and log lines; `deep_clone` is used on
/// edges declared [`NodeConfig::put_deep_copy`] and must copy all mutable
/// reachable state (override it for types with shared interior).
pub trait FlowItem: Clone + Send + 'static {
    /// Short human-readable label for observability.
    fn label(&self) -> String {
        "<item>".to_string()
    }

    /// Value-level copy for deep-copy edges. Defaults to [`Clone`].
    fn deep_clone(&self) -> Self {
        self.clone()
    }
}

impl FlowItem for String {
    fn label(&self) -> String {
        self.clone()
    }
}

impl FlowItem for i64 {
    fn label(&self) -> String {
        self.to_string()
    }
}

/// An element processed by nodes: a live payload or a quarantined failure.
#[derive(Debug, Clone)]
pub enum Packet<T> {
    /// A payload value.
    Value(T),
    /// A processing failure travelling as data.
    Failed(NodeFailure),
}

impl<T: FlowItem> Packet<T> {
    /// Label of the carried payload or failure.
    pub fn label(&self) -> String {
        match self {
            Packet::Value(value) => value.label(),
            Packet::Failed(failure) => format!("failed({})", failure.node),
        }
    }

    /// Returns the payload, if this packet is not a failure.
    pub fn value(&self) -> Option<&T> {
        match self {
            Packet::Value(value) => Some(value),
            Packet::Failed(_) => None,
        }
    }

    /// Returns whether this packet carries a failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, Packet::Failed(_))
    }

    fn deep_clone(&self) -> Self {
        match self {
            Packet::Value(value) => Packet::Value(value.deep_clone()),
            Packet::Failed(failure) => Packet::Failed(failure.clone()),
        }
    }
}

/// Edge predicate deciding which outputs reach a downstream node.
pub struct Predicate<T>(Arc<dyn Fn(&Packet<T>) -> bool + Send + Sync>);

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: FlowItem> Predicate<T> {
    /// Accepts every packet. The default for plain `connect`.
    pub fn accept_all() -> Self {
        Self(Arc::new(|_| true))
    }

    /// Filters payload values; failure packets are always accepted so that
    /// error quarantine keeps working across predicated edges.
    pub fn value(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(move |packet| match packet {
            Packet::Value(value) => f(value),
            Packet::Failed(_) => true,
        }))
    }

    /// Full-packet predicate.
    pub fn packet(f: impl Fn(&Packet<T>) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn accepts(&self, packet: &Packet<T>) -> bool {
        (self.0)(packet)
    }
}

/// Future returned by processing functions.
pub type ProcessFuture<T> =
    Pin<Box<dyn Future<Output = std::result::Result<Option<T>, BoxError>> + Send>>;

/// Boxed processing function over payload values.
pub type ProcessFn<T> = Arc<dyn Fn(T) -> ProcessFuture<T> + Send + Sync>;

/// Boxed generator for `no_input` source nodes.
pub type SourceFn<T> = Arc<dyn Fn() -> ProcessFuture<T> + Send + Sync>;

/// Future returned by the composed packet handler.
pub type PacketFuture<T> = Pin<Box<dyn Future<Output = Option<Packet<T>>> + Send>>;

/// The process layer after retry/failure wrapping; middleware wraps this.
pub type PacketHandler<T> = Arc<dyn Fn(Packet<T>) -> PacketFuture<T> + Send + Sync>;

/// Process-layer middleware. The first middleware added is the innermost
/// layer; the built-in labelling layer is always outermost among these and
/// the skip-error layer is outermost overall.
pub type Middleware<T> = Arc<dyn Fn(PacketHandler<T>) -> PacketHandler<T> + Send + Sync>;

/// Splitter realizing the `input-is-iterable` flag: expands one queue item
/// into independent work units, drained in order under the input lock.
pub type UnpackFn<T> = Arc<dyn Fn(T) -> Vec<T> + Send + Sync>;

/// Synchronous packet hook applied right after `get` or right before
/// `put`, in insertion order.
pub type PacketHook<T> = Arc<dyn Fn(Packet<T>) -> Packet<T> + Send + Sync>;

/// Static configuration of a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Number of cooperating workers.
    pub worker_num: usize,
    /// Payload capacity of the input queue.
    pub queue_size: usize,
    /// The node generates its own data and must have no upstream.
    pub no_input: bool,
    /// The node is a sink and must have no downstream.
    pub no_output: bool,
    /// Empty outputs are expected for this node (logged at debug rather
    /// than warn). Empty outputs are never forwarded either way: the
    /// typed runtime has no nil value to put.
    pub discard_none: bool,
    /// Failure packets entering the node are forwarded unchanged.
    pub skip_errors: bool,
    /// Deliver a value-level copy to every downstream.
    pub put_deep_copy: bool,
    /// Disables the retry loop so the first failure surfaces immediately.
    pub debug_mode: bool,
    /// Poll interval used by idle workers to observe upstream termination.
    pub idle_poll: Duration,
    /// Retry policy applied around the processing function.
    pub retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            worker_num: 1,
            queue_size: 1,
            no_input: false,
            no_output: false,
            discard_none: false,
            skip_errors: true,
            put_deep_copy: false,
            debug_mode: false,
            idle_poll: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker count (minimum one).
    pub fn with_workers(mut self, worker_num: usize) -> Self {
        self.worker_num = worker_num.max(1);
        self
    }

    /// Sets the input queue capacity.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Declares the node as a source without upstream input.
    pub fn no_input(mut self) -> Self {
        self.no_input = true;
        self
    }

    /// Declares the node as a sink without downstream output.
    pub fn no_output(mut self) -> Self {
        self.no_output = true;
        self
    }

    /// Marks empty outputs as expected.
    pub fn discard_none(mut self) -> Self {
        self.discard_none = true;
        self
    }

    /// Controls forwarding of failure packets.
    pub fn skip_errors(mut self, skip: bool) -> Self {
        self.skip_errors = skip;
        self
    }

    /// Delivers value-level copies to every downstream.
    pub fn put_deep_copy(mut self) -> Self {
        self.put_deep_copy = true;
        self
    }

    /// Disables retries so failures surface on the first attempt.
    pub fn debug_mode(mut self) -> Self {
        self.debug_mode = true;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }
}

enum Process<T> {
    Mapper(ProcessFn<T>),
    Source(SourceFn<T>),
}

struct Downstream<T> {
    queue: Queue<Packet<T>>,
    predicate: Predicate<T>,
}

impl<T> Clone for Downstream<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

struct Upstream {
    started: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

enum Step<T> {
    Work(Packet<T>),
    Idle,
    Stop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A worker-pool processing stage.
///
/// Created with [`Node::new`] (or [`Node::source`]), wired with
/// [`Node::connect`], and driven by [`Node::start`]. The node owns its
/// input queue; upstream nodes deliver into it and termination is a typed
/// stop signal flowing through the same queue.
pub struct Node<T: FlowItem> {
    name: String,
    config: NodeConfig,
    // Self-handle for spawning workers; set by `build` via new_cyclic.
    this: Weak<Node<T>>,
    input: Queue<Packet<T>>,
    process: Process<T>,
    unpack: Mutex<Option<UnpackFn<T>>>,
    middleware: Mutex<Vec<Middleware<T>>>,
    get_hooks: Mutex<Vec<PacketHook<T>>>,
    put_hooks: Mutex<Vec<PacketHook<T>>>,
    handler: Mutex<Option<PacketHandler<T>>>,
    downstreams: Mutex<Vec<Downstream<T>>>,
    upstreams: Mutex<Vec<Upstream>>,
    serial: Mutex<Vec<usize>>,
    started: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stopping: AtomicBool,
    live_workers: AtomicUsize,
    // Worker currently responsible for end-of-stream detection. Starts
    // at zero and is promoted when that worker dies early (panic), so a
    // crashed detector cannot wedge the node open.
    detector: AtomicUsize,
    executing: Mutex<Vec<String>>,
    pending: tokio::sync::Mutex<VecDeque<Packet<T>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: FlowItem> Node<T> {
    /// Creates a node around an async processing function.
    ///
    /// The function returns `Ok(Some(out))` to forward a value, `Ok(None)`
    /// to produce nothing, or an error that is retried per the configured
    /// [`RetryPolicy`] before being quarantined as a [`NodeFailure`].
    pub fn new<F, Fut>(name: impl Into<String>, config: NodeConfig, f: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, BoxError>> + Send + 'static,
    {
        let process: ProcessFn<T> = Arc::new(move |value| Box::pin(f(value)) as ProcessFuture<T>);
        Self::build(name.into(), config, Process::Mapper(process))
    }

    /// Creates a `no_input` source node around an async generator.
    pub fn source<F, Fut>(name: impl Into<String>, config: NodeConfig, f: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, BoxError>> + Send + 'static,
    {
        let source: SourceFn<T> = Arc::new(move || Box::pin(f()) as ProcessFuture<T>);
        let config = NodeConfig {
            no_input: true,
            ..config
        };
        Self::build(name.into(), config, Process::Source(source))
    }

    fn build(name: String, config: NodeConfig, process: Process<T>) -> Arc<Self> {
        let input = Queue::bounded(config.queue_size, name.clone());
        Arc::new_cyclic(|this| Self {
            name,
            config,
            this: this.clone(),
            input,
            process,
            unpack: Mutex::new(None),
            middleware: Mutex::new(Vec::new()),
            get_hooks: Mutex::new(Vec::new()),
            put_hooks: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            downstreams: Mutex::new(Vec::new()),
            upstreams: Mutex::new(Vec::new()),
            serial: Mutex::new(Vec::new()),
            started: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            detector: AtomicUsize::new(0),
            executing: Mutex::new(Vec::new()),
            pending: tokio::sync::Mutex::new(VecDeque::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the unpack function expanding one queue item into many
    /// work units. Must be called before [`Node::start`].
    pub fn set_unpack(&self, f: impl Fn(T) -> Vec<T> + Send + Sync + 'static) {
        *lock(&self.unpack) = Some(Arc::new(f));
    }

    /// Appends a process-layer middleware. The first middleware added is
    /// the innermost layer; built-in labelling and skip-error layers stay
    /// outermost regardless of insertion order.
    pub fn add_middleware(&self, middleware: Middleware<T>) {
        lock(&self.middleware).push(middleware);
    }

    /// Appends a hook applied to every packet right after it is pulled
    /// from the input queue (before unpack results are processed).
    pub fn add_get_hook(&self, hook: PacketHook<T>) {
        lock(&self.get_hooks).push(hook);
    }

    /// Appends a hook applied to every packet right before dispatch.
    pub fn add_put_hook(&self, hook: PacketHook<T>) {
        lock(&self.put_hooks).push(hook);
    }

    /// Assigns the topology serial number (set by enclosing composites).
    pub fn set_serial(&self, serial: Vec<usize>) {
        *lock(&self.serial) = serial;
    }

    /// Connects this node to a downstream node, accepting every output.
    pub fn connect(&self, dst: &Node<T>) {
        self.connect_when(dst, Predicate::accept_all());
    }

    /// Connects this node to a downstream node under a predicate.
    pub fn connect_when(&self, dst: &Node<T>, predicate: Predicate<T>) {
        lock(&self.downstreams).push(Downstream {
            queue: dst.input.clone(),
            predicate,
        });
        lock(&dst.upstreams).push(Upstream {
            started: self.started.clone(),
            running: self.running.clone(),
        });
        tracing::debug!(
            target: TRACING_TARGET,
            src = %self.name,
            dst = %dst.name,
            "Connected nodes"
        );
    }

    /// Enqueues a payload into this node's input queue.
    pub async fn put(&self, value: T) -> Result<()> {
        self.input.put(Packet::Value(value)).await
    }

    /// Enqueues a packet (payload or failure) into this node's input queue.
    pub async fn put_packet(&self, packet: Packet<T>) -> Result<()> {
        self.input.put(packet).await
    }

    /// Signals end-of-stream. One stop suffices: the first worker that
    /// observes it re-broadcasts to its siblings.
    pub async fn end(&self) -> Result<()> {
        self.input.put_stop().await
    }

    /// Returns whether any worker of this node is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Validates the topology and spawns the worker pool.
    pub fn start(&self) -> Result<()> {
        self.validate()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        self.compose_handler();
        self.running.store(true, Ordering::Release);
        self.live_workers
            .store(self.config.worker_num, Ordering::Release);

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Internal(format!("node {} has been dropped", self.name)))?;
        let mut tasks = lock(&self.tasks);
        for worker_id in 0..self.config.worker_num {
            let node = Arc::clone(&this);
            tasks.push(tokio::spawn(async move {
                node.worker_loop(worker_id).await;
            }));
        }

        tracing::info!(
            target: TRACING_TARGET,
            node = %self.name,
            workers = self.config.worker_num,
            queue_capacity = self.input.capacity(),
            "Node started"
        );
        Ok(())
    }

    /// Waits until every worker of this node has exited.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                // A panicked worker has already been logged; the pool keeps
                // its invariants because each worker cleans its own state.
                tracing::error!(
                    target: TRACING_TARGET,
                    node = %self.name,
                    error = %err,
                    "Worker task join failed"
                );
            }
        }
    }

    /// Snapshot of this node's observable state.
    pub fn metrics(&self) -> NodeMetrics {
        let serial = lock(&self.serial)
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(".");
        NodeMetrics {
            name: self.name.clone(),
            serial,
            is_running: self.is_running(),
            queue_size: self.input.len(),
            max_queue_size: self.input.capacity(),
            executing_count: lock(&self.executing).len(),
            worker_count: self.config.worker_num,
        }
    }

    fn validate(&self) -> Result<()> {
        let downstream_count = lock(&self.downstreams).len();
        let upstream_count = lock(&self.upstreams).len();
        if self.config.no_output && downstream_count > 0 {
            return Err(Error::UnexpectedDownstream(self.name.clone()));
        }
        if !self.config.no_output && downstream_count == 0 {
            return Err(Error::MissingDownstream(self.name.clone()));
        }
        if self.config.no_input && upstream_count > 0 {
            return Err(Error::UnexpectedUpstream(self.name.clone()));
        }
        Ok(())
    }

    /// Builds the packet handler: retry-wrapped process innermost, then
    /// user middleware in insertion order, then labelling, then the
    /// skip-error layer outermost.
    fn compose_handler(&self) {
        let mut handler = self.base_handler();
        for middleware in lock(&self.middleware).iter() {
            handler = middleware(handler);
        }
        handler = self.label_layer(handler);
        handler = self.skip_layer(handler);
        *lock(&self.handler) = Some(handler);
    }

    fn base_handler(&self) -> PacketHandler<T> {
        let node = self.name.clone();
        let config = self.config.clone();
        let process = match &self.process {
            Process::Mapper(f) => f.clone(),
            // Source nodes never receive packets through the handler; keep
            // a mapper shape that reports misuse instead of panicking.
            Process::Source(_) => {
                let node = node.clone();
                Arc::new(move |_value: T| {
                    let node = node.clone();
                    Box::pin(async move {
                        Err(format!("source node {node} received an input packet").into())
                    }) as ProcessFuture<T>
                })
            }
        };

        Arc::new(move |packet: Packet<T>| {
            let process = process.clone();
            let node = node.clone();
            let config = config.clone();
            Box::pin(async move {
                let value = match packet {
                    Packet::Value(value) => value,
                    Packet::Failed(failure) => {
                        // Only reachable when skip_errors is off; this node
                        // cannot re-process a failure, so it is dropped.
                        tracing::error!(
                            target: TRACING_TARGET,
                            node = %node,
                            source_node = %failure.node,
                            error = %failure.message,
                            "Dropping failure packet on node without skip_errors"
                        );
                        return None;
                    }
                };
                run_with_retry(&node, &config, process, value).await
            }) as PacketFuture<T>
        })
    }

    fn label_layer(&self, inner: PacketHandler<T>) -> PacketHandler<T> {
        let node = self.name.clone();
        Arc::new(move |packet: Packet<T>| {
            let inner = inner.clone();
            let node = node.clone();
            Box::pin(async move {
                let label = packet.label();
                let output = inner(packet).await;
                match &output {
                    Some(out) => tracing::debug!(
                        target: TRACING_TARGET,
                        node = %node,
                        input = %label,
                        output = %out.label(),
                        "Processed"
                    ),
                    None => tracing::trace!(
                        target: TRACING_TARGET,
                        node = %node,
                        input = %label,
                        "Processed with empty output"
                    ),
                }
                output
            }) as PacketFuture<T>
        })
    }

    fn skip_layer(&self, inner: PacketHandler<T>) -> PacketHandler<T> {
        let skip = self.config.skip_errors;
        let node = self.name.clone();
        Arc::new(move |packet: Packet<T>| {
            if skip && packet.is_failed() {
                tracing::debug!(
                    target: TRACING_TARGET,
                    node = %node,
                    input = %packet.label(),
                    "Forwarding failure packet unchanged"
                );
                return Box::pin(std::future::ready(Some(packet))) as PacketFuture<T>;
            }
            inner(packet)
        })
    }

    fn handler(&self) -> PacketHandler<T> {
        lock(&self.handler)
            .clone()
            .expect("handler is composed before workers start")
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(
            target: TRACING_TARGET,
            node = %self.name,
            worker = worker_id,
            "Worker started"
        );

        loop {
            let step = if self.config.no_input {
                self.source_step().await
            } else {
                self.next_step().await
            };

            match step {
                Step::Stop => {
                    self.broadcast_stop().await;
                    break;
                }
                Step::Idle => {
                    let is_detector =
                        self.detector.load(Ordering::Acquire) == worker_id;
                    if is_detector
                        && !self.config.no_input
                        && self.upstream_finished().await
                    {
                        tracing::info!(
                            target: TRACING_TARGET,
                            node = %self.name,
                            "All upstream nodes stopped, ending node"
                        );
                        self.broadcast_stop().await;
                        break;
                    }
                }
                Step::Work(packet) => {
                    if !self.run_packet(packet).await {
                        break;
                    }
                }
            }
        }

        // Hand detection to the next worker in case this exit was early.
        let _ = self.detector.compare_exchange(
            worker_id,
            worker_id + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );

        if self.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.running.store(false, Ordering::Release);
            tracing::info!(
                target: TRACING_TARGET,
                node = %self.name,
                "Node stopped"
            );
        } else {
            tracing::debug!(
                target: TRACING_TARGET,
                node = %self.name,
                worker = worker_id,
                "Worker stopped"
            );
        }
    }

    /// Processes one packet and dispatches the result. Returns `false`
    /// when the worker should exit: a downstream queue vanished, or the
    /// processing function panicked.
    async fn run_packet(&self, packet: Packet<T>) -> bool {
        use futures::FutureExt;

        let label = packet.label();
        lock(&self.executing).push(label.clone());
        let handler = self.handler();
        let output = std::panic::AssertUnwindSafe(handler(packet))
            .catch_unwind()
            .await;
        {
            let mut executing = lock(&self.executing);
            if let Some(pos) = executing.iter().position(|entry| entry == &label) {
                executing.remove(pos);
            }
        }

        let output = match output {
            Ok(output) => output,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                tracing::error!(
                    target: TRACING_TARGET,
                    node = %self.name,
                    input = %label,
                    panic = %message,
                    "Processing panicked, worker exiting"
                );
                return false;
            }
        };

        match output {
            Some(output) => match self.dispatch(output).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(
                        target: TRACING_TARGET,
                        node = %self.name,
                        error = %err,
                        "Failed to dispatch output, stopping worker"
                    );
                    false
                }
            },
            None => true,
        }
    }

    /// Pulls the next work unit. The pending buffer and queue read share
    /// one async lock so unpack expansion preserves upstream order.
    async fn next_step(&self) -> Step<T> {
        let mut pending = self.pending.lock().await;
        if let Some(packet) = pending.pop_front() {
            return Step::Work(packet);
        }

        match self.input.get_timeout(self.config.idle_poll).await {
            Err(_) => Step::Stop,
            Ok(None) => Step::Idle,
            Ok(Some(Signal::Stop)) => Step::Stop,
            Ok(Some(Signal::Item(packet))) => {
                let packet = self.apply_hooks(&self.get_hooks, packet);
                let unpack = lock(&self.unpack).clone();
                match (unpack, packet) {
                    (Some(unpack), Packet::Value(value)) => {
                        pending.extend(unpack(value).into_iter().map(Packet::Value));
                        match pending.pop_front() {
                            Some(packet) => Step::Work(packet),
                            None => Step::Idle,
                        }
                    }
                    (_, packet) => Step::Work(packet),
                }
            }
        }
    }

    /// One iteration of a source node: honor stop signals, then generate.
    async fn source_step(&self) -> Step<T> {
        match self.input.get_timeout(Duration::ZERO).await {
            Err(_) | Ok(Some(Signal::Stop)) => return Step::Stop,
            Ok(Some(Signal::Item(packet))) => return Step::Work(packet),
            Ok(None) => {}
        }

        let Process::Source(generate) = &self.process else {
            return Step::Stop;
        };
        let generate = generate.clone();
        match run_with_retry_source(&self.name, &self.config, generate).await {
            Some(packet) => Step::Work(packet),
            None => {
                tokio::time::sleep(self.config.idle_poll).await;
                Step::Idle
            }
        }
    }

    async fn upstream_finished(&self) -> bool {
        {
            let upstreams = lock(&self.upstreams);
            if upstreams.is_empty() {
                return false;
            }
            let live = upstreams.iter().any(|upstream| {
                !upstream.started.load(Ordering::Acquire)
                    || upstream.running.load(Ordering::Acquire)
            });
            if live {
                return false;
            }
        }
        self.input.is_empty() && self.pending.lock().await.is_empty()
    }

    /// Broadcasts one stop per sibling worker, exactly once per node.
    async fn broadcast_stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 1..self.config.worker_num {
            if self.input.put_stop().await.is_err() {
                break;
            }
        }
    }

    fn apply_hooks(&self, hooks: &Mutex<Vec<PacketHook<T>>>, packet: Packet<T>) -> Packet<T> {
        let hooks = lock(hooks).clone();
        hooks.into_iter().fold(packet, |packet, hook| hook(packet))
    }

    async fn dispatch(&self, packet: Packet<T>) -> Result<()> {
        if self.config.no_output {
            return Ok(());
        }
        let packet = self.apply_hooks(&self.put_hooks, packet);
        let targets: Vec<Downstream<T>> = lock(&self.downstreams)
            .iter()
            .filter(|downstream| downstream.predicate.accepts(&packet))
            .cloned()
            .collect();
        if targets.is_empty() {
            tracing::trace!(
                target: TRACING_TARGET,
                node = %self.name,
                output = %packet.label(),
                "No downstream accepted output"
            );
            return Ok(());
        }

        let last = targets.len() - 1;
        for downstream in &targets[..last] {
            let delivery = if self.config.put_deep_copy {
                packet.deep_clone()
            } else {
                packet.clone()
            };
            downstream.queue.put(delivery).await?;
        }
        let delivery = if self.config.put_deep_copy {
            packet.deep_clone()
        } else {
            packet
        };
        targets[last].queue.put(delivery).await?;
        Ok(())
    }
}

/// Runs a mapper function under the node retry policy, converting retry
/// exhaustion into a failure packet.
async fn run_with_retry<T: FlowItem>(
    node: &str,
    config: &NodeConfig,
    process: ProcessFn<T>,
    value: T,
) -> Option<Packet<T>> {
    let label = value.label();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match process(value.clone()).await {
            Ok(Some(output)) => return Some(Packet::Value(output)),
            Ok(None) => {
                if config.discard_none {
                    tracing::trace!(
                        target: TRACING_TARGET,
                        node = %node,
                        input = %label,
                        "Discarding empty output"
                    );
                } else {
                    tracing::debug!(
                        target: TRACING_TARGET,
                        node = %node,
                        input = %label,
                        "Processing produced no output"
                    );
                }
                return None;
            }
            Err(err) => {
                if !config.debug_mode && config.retry.allows(attempt) {
                    let delay = config.retry.delay(attempt);
                    tracing::warn!(
                        target: TRACING_TARGET,
                        node = %node,
                        input = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Processing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                tracing::error!(
                    target: TRACING_TARGET,
                    node = %node,
                    input = %label,
                    attempts = attempt,
                    error = %err,
                    "Processing failed, quarantining as failure packet"
                );
                return Some(Packet::Failed(NodeFailure::new(node, label, &err)));
            }
        }
    }
}

async fn run_with_retry_source<T: FlowItem>(
    node: &str,
    config: &NodeConfig,
    generate: SourceFn<T>,
) -> Option<Packet<T>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match generate().await {
            Ok(Some(output)) => return Some(Packet::Value(output)),
            Ok(None) => return None,
            Err(err) => {
                if !config.debug_mode && config.retry.allows(attempt) {
                    let delay = config.retry.delay(attempt);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                tracing::error!(
                    target: TRACING_TARGET,
                    node = %node,
                    attempts = attempt,
                    error = %err,
                    "Source generation failed"
                );
                return Some(Packet::Failed(NodeFailure::new(node, "<source>", &err)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn collect_sink(
        name: &str,
        sink: Arc<Mutex<Vec<i64>>>,
        workers: usize,
    ) -> Arc<Node<i64>> {
        Node::new(
            name,
            NodeConfig::new().with_workers(workers).no_output(),
            move |value: i64| {
                let sink = sink.clone();
                async move {
                    lock(&sink).push(value);
                    Ok(Some(value))
                }
            },
        )
    }

    #[tokio::test]
    async fn start_fails_without_downstream() {
        let node = Node::new("lonely", NodeConfig::new(), |value: i64| async move {
            Ok(Some(value))
        });
        assert!(matches!(
            node.start(),
            Err(Error::MissingDownstream(name)) if name == "lonely"
        ));
    }

    #[tokio::test]
    async fn start_fails_with_downstream_on_sink() {
        let sink = Node::new(
            "sink",
            NodeConfig::new().no_output(),
            |value: i64| async move { Ok(Some(value)) },
        );
        let other = Node::new(
            "other",
            NodeConfig::new().no_output(),
            |value: i64| async move { Ok(Some(value)) },
        );
        sink.connect(&other);
        assert!(matches!(
            sink.start(),
            Err(Error::UnexpectedDownstream(_))
        ));
    }

    #[tokio::test]
    async fn fan_out_respects_predicates() {
        let all = Arc::new(Mutex::new(Vec::new()));
        let even = Arc::new(Mutex::new(Vec::new()));

        let head = Node::new(
            "identity",
            NodeConfig::new().with_queue_size(8),
            |value: i64| async move { Ok(Some(value)) },
        );
        let sink_all = collect_sink("all", all.clone(), 1);
        let sink_even = collect_sink("even", even.clone(), 1);

        head.connect(&sink_all);
        head.connect_when(&sink_even, Predicate::value(|value: &i64| value % 2 == 0));

        sink_even.start().unwrap();
        sink_all.start().unwrap();
        head.start().unwrap();

        for value in 1..=5 {
            head.put(value).await.unwrap();
        }
        head.end().await.unwrap();

        head.join().await;
        sink_all.join().await;
        sink_even.join().await;

        assert_eq!(*lock(&all), vec![1, 2, 3, 4, 5]);
        assert_eq!(*lock(&even), vec![2, 4]);
        assert!(!head.is_running());
        assert!(!sink_all.is_running());
    }

    #[tokio::test]
    async fn retry_then_succeed_delivers_exactly_once() {
        let failures = Arc::new(AtomicU32::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let flaky = {
            let failures = failures.clone();
            Node::new(
                "flaky",
                NodeConfig::new().with_retry(
                    RetryPolicy::default()
                        .with_max_attempts(5)
                        .with_max_delay(Duration::from_millis(5)),
                ),
                move |value: i64| {
                    let failures = failures.clone();
                    async move {
                        if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err("transient".into());
                        }
                        Ok(Some(value))
                    }
                },
            )
        };
        let sink = collect_sink("sink", received.clone(), 1);
        flaky.connect(&sink);

        sink.start().unwrap();
        flaky.start().unwrap();

        flaky.put(42).await.unwrap();
        flaky.end().await.unwrap();
        flaky.join().await;
        sink.join().await;

        assert_eq!(*lock(&received), vec![42]);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_forward_failure_through_skipping_node() {
        let observed = Arc::new(Mutex::new(Vec::new()));

        let broken = Node::new(
            "broken",
            NodeConfig::new().with_retry(RetryPolicy::none()),
            |_value: i64| async move {
                Err::<Option<i64>, BoxError>("structural mismatch".into())
            },
        );
        // skip_errors is the default: failures pass through untouched.
        let relay = Node::new("relay", NodeConfig::new(), |value: i64| async move {
            Ok(Some(value))
        });
        let sink = {
            let observed = observed.clone();
            Node::new(
                "observer",
                NodeConfig::new().no_output().skip_errors(false),
                move |value: i64| {
                    let observed = observed.clone();
                    async move {
                        lock(&observed).push(value);
                        Ok(None)
                    }
                },
            )
        };
        broken.connect(&relay);
        relay.connect(&sink);

        sink.start().unwrap();
        relay.start().unwrap();
        broken.start().unwrap();

        broken.put(1).await.unwrap();
        broken.end().await.unwrap();
        broken.join().await;
        relay.join().await;

        // The failure packet reached the sink node (where it was dropped
        // because the sink does not skip errors); no payload came through.
        sink.join().await;
        assert!(lock(&observed).is_empty());
    }

    #[tokio::test]
    async fn unpack_preserves_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let expand = Node::new(
            "expand",
            NodeConfig::new().with_queue_size(4),
            |value: i64| async move { Ok(Some(value)) },
        );
        expand.set_unpack(|value: i64| (0..3).map(|i| value * 10 + i).collect());

        let sink = collect_sink("sink", received.clone(), 1);
        expand.connect(&sink);

        sink.start().unwrap();
        expand.start().unwrap();

        expand.put(1).await.unwrap();
        expand.put(2).await.unwrap();
        expand.end().await.unwrap();
        expand.join().await;
        sink.join().await;

        assert_eq!(*lock(&received), vec![10, 11, 12, 20, 21, 22]);
    }

    #[tokio::test]
    async fn panicking_worker_does_not_wedge_the_node() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let shaky = Node::new(
            "shaky",
            NodeConfig::new()
                .with_workers(2)
                .with_queue_size(4)
                .with_idle_poll(Duration::from_millis(10)),
            |value: i64| async move {
                assert!(value != 13, "unlucky input");
                Ok(Some(value))
            },
        );
        let sink = collect_sink("sink", received.clone(), 1);
        shaky.connect(&sink);

        sink.start().unwrap();
        shaky.start().unwrap();

        for value in [13, 1, 2, 3] {
            shaky.put(value).await.unwrap();
        }
        shaky.end().await.unwrap();
        shaky.join().await;
        sink.join().await;

        let mut received = lock(&received).clone();
        received.sort_unstable();
        assert_eq!(received, vec![1, 2, 3]);
        assert!(!shaky.is_running());
        assert!(shaky.metrics().executing_count == 0);
    }

    #[tokio::test]
    async fn hooks_run_on_get_and_put() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let node = Node::new(
            "hooked",
            NodeConfig::new().with_queue_size(4),
            |value: i64| async move { Ok(Some(value)) },
        );
        node.add_get_hook(Arc::new(|packet: Packet<i64>| match packet {
            Packet::Value(value) => Packet::Value(value * 10),
            other => other,
        }));
        node.add_put_hook(Arc::new(|packet: Packet<i64>| match packet {
            Packet::Value(value) => Packet::Value(value + 1),
            other => other,
        }));
        let sink = collect_sink("sink", received.clone(), 1);
        node.connect(&sink);

        sink.start().unwrap();
        node.start().unwrap();
        node.put(4).await.unwrap();
        node.end().await.unwrap();
        node.join().await;
        sink.join().await;

        assert_eq!(*lock(&received), vec![41]);
    }

    #[tokio::test]
    async fn metrics_reflect_configuration() {
        let node = Node::new(
            "metrics",
            NodeConfig::new().with_workers(3).with_queue_size(7).no_output(),
            |value: i64| async move { Ok(Some(value)) },
        );
        node.set_serial(vec![2, 1]);
        let metrics = node.metrics();
        assert_eq!(metrics.name, "metrics");
        assert_eq!(metrics.serial, "2.1");
        assert_eq!(metrics.worker_count, 3);
        assert_eq!(metrics.max_queue_size, 7);
        assert!(!metrics.is_running);
    }
}
