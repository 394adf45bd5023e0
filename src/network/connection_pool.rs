use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::cluster::Host;
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, FrameError,
};
use crate::frame::request::SerializableRequest;
use crate::observability::metrics::Metrics;
use crate::policies::reconnection_policy::{
    ExponentialReconnectionPolicy, ReconnectionPolicy, ReconnectionSchedule,
};
use crate::routing::{Shard, ShardPortCalculator, ShardingInfo, Token};

use super::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, ResponseReceiver, Task,
    VerifiedKeyspaceName,
};

/// Receives the state edges of a pool. All callbacks are invoked from the
/// pool's worker task and are expected to return quickly.
pub trait ConnectionPoolListener: Send + Sync {
    /// The pool got its first live connection (again).
    fn on_pool_up(&self, _address: SocketAddr) {}

    /// The pool lost its last live connection.
    fn on_pool_down(&self, _address: SocketAddr) {}

    /// The node rejects this client as configured; the pool is closing.
    /// Emitted at most once per pool.
    fn on_pool_critical_error(&self, _address: SocketAddr, _error: &ConnectionError) {}

    /// Some connections have buffered writes; please call
    /// [`ConnectionPool::flush`] at the next convenience.
    fn on_requires_flush(&self, _address: SocketAddr) {}

    /// The pool has released its last resources.
    fn on_close(&self, _address: SocketAddr) {}
}

/// Settings of a single node's connection pool.
#[derive(Clone)]
pub struct PoolSettings {
    pub connection_config: ConnectionConfig,
    /// The total number of connections the pool tries to keep open towards
    /// its node, distributed evenly across the node's shards.
    pub num_connections_per_host: NonZeroUsize,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            num_connections_per_host: NonZeroUsize::new(1).unwrap(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
        }
    }
}

/// A live connection owned by a pool.
///
/// Ownership is shared between the pool and any request currently riding on
/// the connection, so teardown cannot race with response handling.
pub struct PooledConnection {
    id: u64,
    connection: Connection,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    // Outgoing frames accumulate here until the pool's owner calls flush().
    write_buffer: StdMutex<Vec<Task>>,
}

impl PooledConnection {
    fn new(id: u64, connection: Connection, pool_events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self {
            id,
            connection,
            pool_events,
            write_buffer: StdMutex::new(Vec::new()),
        }
    }

    /// The shard this connection is attached to; 0 on un-sharded nodes.
    pub fn shard_id(&self) -> Shard {
        self.connection.shard_id()
    }

    /// The number of requests sent on this connection whose responses have
    /// not arrived yet.
    pub fn inflight_request_count(&self) -> usize {
        self.connection.inflight_request_count()
    }

    /// True once teardown of this connection has begun, for any reason:
    /// a local close, a remote hangup or a keepalive timeout.
    pub fn is_closing(&self) -> bool {
        self.connection.is_closing()
    }

    pub fn get_connect_address(&self) -> SocketAddr {
        self.connection.get_connect_address()
    }

    /// Enqueues a request on this connection and returns the channel its
    /// response will arrive on. The request is not put on the wire until the
    /// pool is flushed; the pool's listener is asked for a flush whenever
    /// this connection's buffer becomes non-empty.
    pub fn write<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<ResponseReceiver, FrameError> {
        let (task, response_receiver) = self.connection.prepare_task(request)?;

        let buffer_was_empty = {
            let mut buffer = self.write_buffer.lock().unwrap();
            let was_empty = buffer.is_empty();
            buffer.push(task);
            was_empty
        };
        if buffer_was_empty {
            let _ = self.pool_events.send(PoolEvent::RequiresFlush(self.id));
        }

        Ok(response_receiver)
    }

    /// Moves all buffered requests to the connection's writer.
    fn flush(&self) {
        let tasks = mem::take(&mut *self.write_buffer.lock().unwrap());
        for task in tasks {
            self.connection.submit(task);
        }
    }

    /// Begins a graceful shutdown. The pool is notified once the underlying
    /// resources are torn down, and only then forgets the connection.
    pub fn close(&self) {
        self.connection.close();
    }
}

enum PoolEvent {
    RequiresFlush(u64),
}

enum PoolCommand {
    Close,
    Flush,
    AttemptImmediateConnect,
    SetKeyspace(VerifiedKeyspaceName),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectorSignal {
    Wait,
    ConnectNow,
    Cancel,
}

// Monotonic; a pool never reopens.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CloseState {
    Open,
    Closing,
    WaitingForConnections,
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NotifyState {
    New,
    Up,
    Down,
    Critical,
}

// What dispatch reads. Connection flags and inflight counters are atomics,
// so a snapshot stays accurate between pool updates.
struct PoolSnapshot {
    sharding_info: Option<ShardingInfo>,
    connections_by_shard: Vec<Vec<Arc<PooledConnection>>>,
}

impl PoolSnapshot {
    fn empty() -> Self {
        Self {
            sharding_info: None,
            connections_by_shard: Vec::new(),
        }
    }
}

/// A pool of connections to a single node, partitioned by the node's shards.
///
/// The pool maintains up to
/// `ceil(num_connections_per_host / nr_shards)` connections per shard,
/// repairing the population in the background whenever a connection is lost,
/// and dispatches each request onto the least busy connection of the shard
/// owning the request's token.
///
/// All pool state lives on a worker task; this handle posts commands to it.
/// Dropping the handle closes the pool.
pub struct ConnectionPool {
    address: SocketAddr,
    shared: Arc<ArcSwap<PoolSnapshot>>,
    command_sender: mpsc::UnboundedSender<PoolCommand>,
}

impl ConnectionPool {
    /// Creates a pool over a starter set of already-open connections
    /// (possibly empty; typically one, the control connection) and
    /// immediately starts filling every under-populated shard slot.
    pub fn new(
        initial_connections: Vec<(Connection, ErrorReceiver)>,
        listener: Arc<dyn ConnectionPoolListener>,
        host: Arc<Host>,
        settings: PoolSettings,
        metrics: Arc<Metrics>,
        shard_port_calculator: Option<Arc<ShardPortCalculator>>,
    ) -> Self {
        let address = host.address;
        let shared = Arc::new(ArcSwap::from_pointee(PoolSnapshot::empty()));
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (pool_event_sender, pool_event_receiver) = mpsc::unbounded_channel();

        let sharding_info = host.sharding_info();
        let num_connections_per_shard = match &sharding_info {
            Some(si) => settings
                .num_connections_per_host
                .get()
                .div_ceil(si.nr_shards().get() as usize),
            None => settings.num_connections_per_host.get(),
        };
        let nr_slots = sharding_info
            .as_ref()
            .map_or(1, |si| si.nr_shards().get() as usize);

        let worker = PoolWorker {
            host,
            settings,
            listener,
            metrics,
            shard_port_calculator,
            sharding_info,
            num_connections_per_shard,
            connections_by_shard: vec![Vec::new(); nr_slots],
            shared: shared.clone(),
            current_keyspace: None,
            pending_connectors: HashMap::new(),
            connector_events: FuturesUnordered::new(),
            broken_connections: FuturesUnordered::new(),
            to_flush: HashMap::new(),
            pool_event_sender,
            close_state: CloseState::Open,
            notify_state: NotifyState::New,
            next_id: 0,
        };
        tokio::spawn(worker.run(initial_connections, command_receiver, pool_event_receiver));

        Self {
            address,
            shared,
            command_sender,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Selects the connection the request with the given token should ride
    /// on.
    ///
    /// With a token and a sharded node, only the token's shard is
    /// considered; if that shard has no usable connection, any live
    /// connection of the pool is returned instead - a mis-routed request is
    /// served by the node anyway, just slower. Without a token (or without
    /// sharding information), the least busy connection of the whole pool
    /// wins. Returns `None` when the pool has no usable connection at all.
    pub fn find_least_busy(&self, token: Option<Token>) -> Option<Arc<PooledConnection>> {
        let snapshot = self.shared.load();

        if let (Some(token), Some(sharding_info)) = (token, snapshot.sharding_info.as_ref()) {
            let shard = sharding_info.shard_of(token) as usize;
            let slot_best = snapshot
                .connections_by_shard
                .get(shard)
                .and_then(|slot| least_busy_of(slot.iter()));
            if let Some(connection) = slot_best {
                if !connection.is_closing() {
                    return Some(connection.clone());
                }
            }
            // The right shard cannot serve the request; fall back to the
            // whole pool.
        }

        least_busy_of(
            snapshot
                .connections_by_shard
                .iter()
                .flatten()
                .filter(|conn| !conn.is_closing()),
        )
        .cloned()
    }

    /// Whether the pool currently holds any connection.
    pub fn has_connections(&self) -> bool {
        self.shared
            .load()
            .connections_by_shard
            .iter()
            .any(|slot| !slot.is_empty())
    }

    /// Puts all buffered writes of the pool's connections on the wire.
    /// Called by the pool's owner in response to
    /// [`ConnectionPoolListener::on_requires_flush`].
    pub fn flush(&self) {
        let _ = self.command_sender.send(PoolCommand::Flush);
    }

    /// Begins closing the pool. Idempotent. Once every connection and every
    /// pending connect attempt has terminated,
    /// [`ConnectionPoolListener::on_close`] fires.
    pub fn close(&self) {
        let _ = self.command_sender.send(PoolCommand::Close);
    }

    /// Fast-forwards the delays of all pending reconnect attempts to zero.
    /// Used when the owner has reason to believe the node just came back.
    pub fn attempt_immediate_connect(&self) {
        let _ = self.command_sender.send(PoolCommand::AttemptImmediateConnect);
    }

    /// Makes future connections of this pool issue `USE keyspace` during
    /// setup. Existing connections are not touched.
    pub fn set_keyspace(&self, keyspace: VerifiedKeyspaceName) {
        let _ = self.command_sender.send(PoolCommand::SetKeyspace(keyspace));
    }
}

// Is `a` strictly a better dispatch choice than `b`? Closing connections
// never beat live ones, whatever their load.
fn less_busy(a: &PooledConnection, b: &PooledConnection) -> bool {
    if a.is_closing() {
        false
    } else if b.is_closing() {
        true
    } else {
        a.inflight_request_count() < b.inflight_request_count()
    }
}

// Ties resolve to the earliest connection in iteration order.
fn least_busy_of<'a>(
    connections: impl Iterator<Item = &'a Arc<PooledConnection>>,
) -> Option<&'a Arc<PooledConnection>> {
    let mut best: Option<&'a Arc<PooledConnection>> = None;
    for connection in connections {
        match best {
            None => best = Some(connection),
            Some(current) => {
                if less_busy(connection, current) {
                    best = Some(connection);
                }
            }
        }
    }
    best
}

struct ConnectorEvent {
    connector_id: u64,
    desired_shard: Option<Shard>,
    // Rides along so that a follow-up attempt for the same slot keeps
    // growing the backoff.
    schedule: Box<dyn ReconnectionSchedule>,
    outcome: ConnectOutcome,
}

enum ConnectOutcome {
    Connected {
        connection: Connection,
        error_receiver: ErrorReceiver,
    },
    Canceled,
    Error(ConnectionError),
}

struct BrokenConnectionEvent {
    connection: Weak<PooledConnection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<PooledConnection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelClosed).into()
        }),
    }
}

struct PoolWorker {
    host: Arc<Host>,
    settings: PoolSettings,
    listener: Arc<dyn ConnectionPoolListener>,
    metrics: Arc<Metrics>,
    shard_port_calculator: Option<Arc<ShardPortCalculator>>,

    // The shard layout the pool was created with. A node never reshards
    // within the lifetime of its Host record, so this is immutable.
    sharding_info: Option<ShardingInfo>,
    num_connections_per_shard: usize,
    connections_by_shard: Vec<Vec<Arc<PooledConnection>>>,
    shared: Arc<ArcSwap<PoolSnapshot>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    // Cancellation/fast-forward handles of the in-flight connect attempts.
    pending_connectors: HashMap<u64, watch::Sender<ConnectorSignal>>,
    connector_events: FuturesUnordered<BoxFuture<'static, ConnectorEvent>>,
    broken_connections: FuturesUnordered<BoxFuture<'static, BrokenConnectionEvent>>,

    to_flush: HashMap<u64, Arc<PooledConnection>>,
    pool_event_sender: mpsc::UnboundedSender<PoolEvent>,

    close_state: CloseState,
    notify_state: NotifyState,

    next_id: u64,
}

impl PoolWorker {
    async fn run(
        mut self,
        initial_connections: Vec<(Connection, ErrorReceiver)>,
        mut command_receiver: mpsc::UnboundedReceiver<PoolCommand>,
        mut pool_event_receiver: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        debug!(
            "[{}] Starting connection pool worker ({} shard slots, {} connections per shard)",
            self.address(),
            self.connections_by_shard.len(),
            self.num_connections_per_shard,
        );

        for (connection, error_receiver) in initial_connections {
            if connection.is_closing() {
                continue;
            }
            // try_add closes the connection itself when its shard slot is
            // already full.
            self.try_add_connection(connection, error_receiver);
        }
        self.update_shared();
        self.notify_up_or_down();

        // Schedule one connect attempt per connection still missing.
        for shard in 0..self.connections_by_shard.len() {
            let missing = self
                .num_connections_per_shard
                .saturating_sub(self.connections_by_shard[shard].len());
            for _ in 0..missing {
                self.schedule_reconnect(None, Some(shard as Shard));
            }
        }

        let mut command_channel_open = true;
        loop {
            tokio::select! {
                event = self.connector_events.select_next_some(),
                        if !self.connector_events.is_empty() => {
                    self.handle_connector_event(event);
                }
                event = self.broken_connections.select_next_some(),
                        if !self.broken_connections.is_empty() => {
                    self.handle_broken_connection(event);
                }
                event = pool_event_receiver.recv() => {
                    // The worker keeps one sender alive, so this never yields
                    // None.
                    if let Some(PoolEvent::RequiresFlush(id)) = event {
                        self.handle_requires_flush(id);
                    }
                }
                command = command_receiver.recv(), if command_channel_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Every pool handle is gone; nobody can use the
                            // connections anymore.
                            trace!("[{}] Pool handle dropped, closing", self.address());
                            command_channel_open = false;
                            self.start_close();
                        }
                    }
                }
            }

            if self.close_state == CloseState::Closed {
                break;
            }
            #[cfg(debug_assertions)]
            self.check_invariants();
        }

        debug!("[{}] Connection pool worker stopped", self.address());
    }

    fn address(&self) -> SocketAddr {
        self.host.address
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_connections(&self) -> bool {
        self.connections_by_shard.iter().any(|slot| !slot.is_empty())
    }

    fn update_shared(&self) {
        self.shared.store(Arc::new(PoolSnapshot {
            sharding_info: self.sharding_info.clone(),
            connections_by_shard: self.connections_by_shard.clone(),
        }));
    }

    // Wraps the connection and puts it into its shard's slot, unless the
    // slot is full - then the connection is closed instead. The server
    // chooses the shard, so an attempt aimed at an under-populated shard can
    // still come back on an over-populated one.
    fn try_add_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
    ) -> bool {
        let shard = connection.shard_id() as usize;
        let has_room = self
            .connections_by_shard
            .get(shard)
            .is_some_and(|slot| slot.len() < self.num_connections_per_shard);
        if !has_room {
            connection.close();
            return false;
        }

        let id = self.alloc_id();
        let pooled = Arc::new(PooledConnection::new(
            id,
            connection,
            self.pool_event_sender.clone(),
        ));
        self.broken_connections
            .push(wait_for_error(Arc::downgrade(&pooled), error_receiver).boxed());
        self.metrics.inc_total_connections();
        self.connections_by_shard[shard].push(pooled);
        debug!(
            "[{}] Added connection to shard {}, now there are {} for the shard, total {}",
            self.address(),
            shard,
            self.connections_by_shard[shard].len(),
            self.connections_by_shard.iter().map(Vec::len).sum::<usize>(),
        );
        true
    }

    fn handle_connector_event(&mut self, event: ConnectorEvent) {
        self.pending_connectors.remove(&event.connector_id);

        if self.close_state != CloseState::Open {
            // The pool is going down; a connection which still made it
            // through is surplus.
            if let ConnectOutcome::Connected { connection, .. } = event.outcome {
                connection.close();
            }
            self.maybe_closed();
            return;
        }

        match event.outcome {
            ConnectOutcome::Connected {
                connection,
                error_receiver,
            } => {
                let shard = connection.shard_id();
                if self.try_add_connection(connection, error_receiver) {
                    self.notify_up_or_down();
                    self.update_shared();
                    // The slot is filled; the schedule dies here.
                } else {
                    debug!(
                        "[{}] Reconnection connected us to shard {}, which is full; reconnecting again",
                        self.address(),
                        shard,
                    );
                    self.schedule_reconnect(Some(event.schedule), event.desired_shard);
                }
            }
            ConnectOutcome::Canceled => {
                // Nothing to do: the attempt died without a successor, so
                // its schedule is dropped.
            }
            ConnectOutcome::Error(error) => {
                if error.is_critical() {
                    error!(
                        "[{}] Closing connection pool because of a fatal error: {}",
                        self.address(),
                        error,
                    );
                    self.notify_critical_error(&error);
                    self.start_close();
                } else {
                    warn!(
                        "[{}] Unable to reconnect: {}; will retry",
                        self.address(),
                        error,
                    );
                    self.schedule_reconnect(Some(event.schedule), event.desired_shard);
                }
            }
        }
    }

    fn handle_broken_connection(&mut self, event: BrokenConnectionEvent) {
        let Some(connection) = event.connection.upgrade() else {
            return;
        };
        debug!(
            "[{}] Connection to shard {} is gone: {}",
            self.address(),
            connection.shard_id(),
            event.error,
        );

        let shard = connection.shard_id() as usize;
        if let Some(slot) = self.connections_by_shard.get_mut(shard) {
            if let Some(position) = slot.iter().position(|conn| conn.id == connection.id) {
                slot.remove(position);
                self.metrics.dec_total_connections();
            }
        }
        self.to_flush.remove(&connection.id);
        self.update_shared();

        if self.close_state != CloseState::Open {
            self.maybe_closed();
            return;
        }

        // This removal may have taken the last connection away.
        self.notify_up_or_down();
        // Try to restore the population of the same shard.
        self.schedule_reconnect(None, Some(connection.shard_id()));
    }

    fn handle_requires_flush(&mut self, id: u64) {
        let Some(connection) = self
            .connections_by_shard
            .iter()
            .flatten()
            .find(|conn| conn.id == id)
            .cloned()
        else {
            // The connection was removed between buffering the write and
            // this event; its buffer dies with it.
            return;
        };
        if self.to_flush.is_empty() {
            self.listener.on_requires_flush(self.address());
        }
        self.to_flush.insert(id, connection);
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Close => self.start_close(),
            PoolCommand::Flush => {
                for (_, connection) in self.to_flush.drain() {
                    connection.flush();
                }
            }
            PoolCommand::AttemptImmediateConnect => {
                if self.close_state == CloseState::Open {
                    for signal in self.pending_connectors.values() {
                        let _ = signal.send(ConnectorSignal::ConnectNow);
                    }
                }
            }
            PoolCommand::SetKeyspace(keyspace) => {
                debug!(
                    "[{}] Future connections will use keyspace {}",
                    self.address(),
                    keyspace.as_str(),
                );
                self.current_keyspace = Some(keyspace);
            }
        }
    }

    fn notify_up_or_down(&mut self) {
        let has_connections = self.has_connections();
        match (self.notify_state, has_connections) {
            (NotifyState::New | NotifyState::Up, false) => {
                self.notify_state = NotifyState::Down;
                self.host.set_up(false);
                self.listener.on_pool_down(self.address());
            }
            (NotifyState::New | NotifyState::Down, true) => {
                self.notify_state = NotifyState::Up;
                self.host.set_up(true);
                self.listener.on_pool_up(self.address());
            }
            _ => {}
        }
    }

    fn notify_critical_error(&mut self, error: &ConnectionError) {
        if self.notify_state != NotifyState::Critical {
            self.notify_state = NotifyState::Critical;
            self.listener.on_pool_critical_error(self.address(), error);
        }
    }

    // Spawns one delayed connect attempt. A fresh schedule is created unless
    // the attempt continues a failed one, in which case the failed attempt's
    // schedule is passed in and its backoff keeps growing.
    fn schedule_reconnect(
        &mut self,
        schedule: Option<Box<dyn ReconnectionSchedule>>,
        desired_shard: Option<Shard>,
    ) {
        let mut schedule = schedule
            .unwrap_or_else(|| self.settings.reconnection_policy.new_reconnection_schedule());
        let delay = schedule.next_delay();

        // Aiming at a specific shard is only possible when the node
        // advertises a shard-aware port.
        let desired_shard = desired_shard.filter(|_| {
            self.sharding_info
                .as_ref()
                .is_some_and(ShardingInfo::has_shard_aware_port)
        });

        debug!(
            "[{}] Scheduling reconnect in {:?} (desired shard: {:?})",
            self.address(),
            delay,
            desired_shard,
        );

        let connector_id = self.alloc_id();
        let (signal_sender, signal_receiver) = watch::channel(ConnectorSignal::Wait);
        self.pending_connectors.insert(connector_id, signal_sender);

        let context = ConnectorContext {
            connector_id,
            address: self.address(),
            config: self.settings.connection_config.clone(),
            keyspace: self.current_keyspace.clone(),
            sharding_info: self.sharding_info.clone(),
            shard_port_calculator: self.shard_port_calculator.clone(),
            metrics: self.metrics.clone(),
            desired_shard,
            delay,
        };
        self.connector_events
            .push(delayed_connect(context, schedule, signal_receiver).boxed());
    }

    fn start_close(&mut self) {
        if self.close_state != CloseState::Open {
            return;
        }
        debug!("[{}] Closing connection pool", self.address());
        self.close_state = CloseState::Closing;

        // Each close comes back through the broken-connection path, which
        // mutates the slots; iterate over a copy.
        let connections: Vec<_> = self.connections_by_shard.iter().flatten().cloned().collect();
        for connection in connections {
            connection.close();
        }

        for signal in self.pending_connectors.values() {
            let _ = signal.send(ConnectorSignal::Cancel);
        }

        self.close_state = CloseState::WaitingForConnections;
        self.maybe_closed();
    }

    fn maybe_closed(&mut self) {
        // The pool is done once all connections and pending connect attempts
        // have terminated.
        if self.close_state == CloseState::WaitingForConnections
            && !self.has_connections()
            && self.pending_connectors.is_empty()
        {
            self.close_state = CloseState::Closed;
            // Only mark DOWN if it's UP, otherwise the listener might see
            // multiple DOWN events while the pool is connecting.
            if self.notify_state == NotifyState::Up {
                self.host.set_up(false);
                self.listener.on_pool_down(self.address());
            }
            self.shared.store(Arc::new(PoolSnapshot::empty()));
            self.listener.on_close(self.address());
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        use std::collections::HashSet;

        let mut seen_ids = HashSet::new();
        for slot in &self.connections_by_shard {
            debug_assert!(slot.len() <= self.num_connections_per_shard);
            for connection in slot {
                debug_assert!(
                    seen_ids.insert(connection.id),
                    "connection present in more than one shard slot"
                );
            }
        }

        if self.close_state == CloseState::Open {
            debug_assert_eq!(
                self.notify_state == NotifyState::Up,
                !seen_ids.is_empty(),
                "notify state out of sync with the connection count"
            );
        }
    }
}

struct ConnectorContext {
    connector_id: u64,
    address: SocketAddr,
    config: ConnectionConfig,
    keyspace: Option<VerifiedKeyspaceName>,
    sharding_info: Option<ShardingInfo>,
    shard_port_calculator: Option<Arc<ShardPortCalculator>>,
    metrics: Arc<Metrics>,
    desired_shard: Option<Shard>,
    delay: Duration,
}

// One delayed connect attempt. Resolves exactly once; cancellation during
// the delay costs no syscall, cancellation later lets the handshake finish
// and then closes the socket, so the server never sees a half-open setup.
async fn delayed_connect(
    context: ConnectorContext,
    schedule: Box<dyn ReconnectionSchedule>,
    mut signal: watch::Receiver<ConnectorSignal>,
) -> ConnectorEvent {
    let outcome = connect_attempt(&context, &mut signal).await;
    ConnectorEvent {
        connector_id: context.connector_id,
        desired_shard: context.desired_shard,
        schedule,
        outcome,
    }
}

async fn connect_attempt(
    context: &ConnectorContext,
    signal: &mut watch::Receiver<ConnectorSignal>,
) -> ConnectOutcome {
    let sleep = tokio::time::sleep(context.delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => break,
            changed = signal.changed() => {
                let latest = match changed {
                    // The pool is gone entirely.
                    Err(_) => ConnectorSignal::Cancel,
                    Ok(()) => *signal.borrow(),
                };
                match latest {
                    ConnectorSignal::Cancel => return ConnectOutcome::Canceled,
                    ConnectorSignal::ConnectNow => break,
                    ConnectorSignal::Wait => {}
                }
            }
        }
    }

    // Pick the route: a shard-aware port pins the connection to
    // `source_port % nr_shards`, so aim the source port at the desired
    // shard. Without a calculator-provided port the OS picks one and the
    // server decides the shard.
    let mut connect_address = context.address;
    let mut source_port = None;
    if let (Some(desired_shard), Some(sharding_info)) =
        (context.desired_shard, context.sharding_info.as_ref())
    {
        if let Some(port) = sharding_info.shard_aware_port() {
            connect_address.set_port(port);
        }
        source_port = context
            .shard_port_calculator
            .as_ref()
            .and_then(|calc| calc.outgoing_port(sharding_info.nr_shards(), desired_shard));
    }

    let result = open_connection(
        connect_address,
        source_port,
        &context.config,
        context.keyspace.as_ref(),
    )
    .await;

    if let (Some(port), Some(calculator)) = (source_port, &context.shard_port_calculator) {
        calculator.release_port(port);
    }

    if let Err(ConnectionError::ConnectTimeout) = &result {
        context.metrics.inc_connection_timeouts();
    }

    let canceled_midway = *signal.borrow() == ConnectorSignal::Cancel;
    match result {
        Ok((connection, error_receiver)) => {
            if canceled_midway {
                connection.close();
                ConnectOutcome::Canceled
            } else {
                ConnectOutcome::Connected {
                    connection,
                    error_receiver,
                }
            }
        }
        Err(error) => {
            if canceled_midway {
                ConnectOutcome::Canceled
            } else {
                ConnectOutcome::Error(error)
            }
        }
    }
}
