use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, FrameError,
    RequestError, ShardingError,
};
use crate::frame::request::{AuthResponse, Options, Query, SerializableRequest, Startup};
use crate::frame::response::{Authenticate, Response, ResponseOpcode, Supported};
use crate::frame::{read_response_frame, FrameParams, SerializedRequest};
use crate::routing::{ConnectionShardingInfo, Shard, ShardingInfo};

/// Plain username/password credentials for the server's PasswordAuthenticator.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Configuration used for new connections.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub local_ip_address: Option<IpAddr>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,

    /// How often the connection issues a synthetic OPTIONS request to keep
    /// itself warm. `None` disables both the heartbeat and the idle check.
    pub keepalive_interval: Option<Duration>,
    /// How long to wait for the response to a keepalive request before
    /// declaring the connection broken.
    pub keepalive_timeout: Option<Duration>,
    /// If no server traffic at all arrives for this long, the connection is
    /// considered defunct and breaks itself.
    pub idle_timeout: Option<Duration>,

    pub credentials: Option<Credentials>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_ip_address: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(60)),
            credentials: None,
        }
    }
}

/// Can be used to wait for the moment the connection breaks.
/// The pool uses it to learn when a connection has to be replaced.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// Yields the response to a single request once it arrives.
pub type ResponseReceiver = oneshot::Receiver<Result<TaskResponse, RequestError>>;

/// A response as it came off the wire: the body stays opaque here.
pub struct TaskResponse {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

pub(crate) struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestError>>,
    // Keeps the inflight count accurate no matter which way the request
    // leaves the connection: response, error fan-out or teardown.
    _inflight: InflightGuard,
}

struct InflightGuard {
    stats: Arc<ConnectionStats>,
}

impl InflightGuard {
    fn new(stats: Arc<ConnectionStats>) -> Self {
        stats.inflight.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.stats.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ConnectionStats {
    epoch: Instant,
    inflight: AtomicUsize,
    last_traffic_ms: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            inflight: AtomicUsize::new(0),
            last_traffic_ms: AtomicU64::new(0),
        }
    }

    fn record_traffic(&self) {
        self.last_traffic_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn time_since_last_traffic(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_traffic_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// A single connection to a node, speaking the CQL protocol over TCP.
///
/// The connection's socket is serviced by a router task running the reader,
/// writer and keepalive loops; the `Connection` itself is a cheap handle.
/// Dropping the last handle tears the router down.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    shard_info: Option<ConnectionShardingInfo>,
    submit_sender: mpsc::UnboundedSender<Task>,
    stats: Arc<ConnectionStats>,
    closing: Arc<AtomicBool>,
    shutdown_requested: Arc<Notify>,
}

impl Connection {
    /// Opens a connection and makes it ready to send/receive CQL frames on
    /// it, but does not yet send any (no OPTIONS/STARTUP handshake).
    async fn new(
        connect_address: SocketAddr,
        source_port: Option<u16>,
        config: &ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector = tokio::time::timeout(
            config.connect_timeout,
            connect_with_source_ip_and_port(connect_address, config.local_ip_address, source_port),
        )
        .await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        // Unbounded so that the pool can move buffered writes into the
        // channel without awaiting; the pool bounds what it buffers.
        let (submit_sender, submit_receiver) = mpsc::unbounded_channel();
        let (error_sender, error_receiver) = oneshot::channel();

        let stats = Arc::new(ConnectionStats::new());
        let closing = Arc::new(AtomicBool::new(false));
        let shutdown_requested = Arc::new(Notify::new());

        let router = Self::router(
            config.clone(),
            stream,
            submit_receiver,
            submit_sender.clone(),
            error_sender,
            stats.clone(),
            closing.clone(),
            shutdown_requested.clone(),
            connect_address,
        );
        let (task, worker_handle) = router.remote_handle();
        tokio::spawn(task);

        let connection = Connection {
            _worker_handle: worker_handle,
            connect_address,
            shard_info: None,
            submit_sender,
            stats,
            closing,
            shutdown_requested,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // "Time" in socket2's vocabulary is the idle time after which probes
        // begin to be sent, which is what our interval option means.
        let tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);
        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// The sharding parameters this connection received in its SUPPORTED
    /// frame, if the node is sharded.
    pub fn sharding_info(&self) -> Option<&ConnectionShardingInfo> {
        self.shard_info.as_ref()
    }

    /// The shard the server assigned to this connection; 0 on un-sharded
    /// nodes.
    pub fn shard_id(&self) -> Shard {
        self.shard_info.as_ref().map_or(0, |si| si.shard as Shard)
    }

    pub fn inflight_request_count(&self) -> usize {
        self.stats.inflight.load(Ordering::Relaxed)
    }

    /// True once the teardown of this connection has begun, for whatever
    /// reason.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Begins a shutdown of the connection. The routing worker terminates,
    /// fails all outstanding requests and fires the error receiver, which is
    /// how the owning pool learns about the closure.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::Relaxed) {
            self.shutdown_requested.notify_one();
        }
    }

    /// Serializes a request and pairs it with a channel on which its
    /// response will arrive.
    pub(crate) fn prepare_task<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<(Task, ResponseReceiver), FrameError> {
        prepare_task(request, &self.stats)
    }

    /// Hands a task over to the writer loop.
    pub(crate) fn submit(&self, task: Task) {
        if let Err(send_error) = self.submit_sender.send(task) {
            let task = send_error.0;
            let _ = task.response_handler.response_sender.send(Err(
                BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelClosed).into(),
            ));
        }
    }

    pub(crate) async fn send_request<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<TaskResponse, RequestError> {
        let (task, response_receiver) = self.prepare_task(request)?;
        self.submit(task);
        response_receiver
            .await
            .map_err(|_| -> RequestError {
                BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelClosed).into()
            })?
    }

    /// Sends a request and parses the response body.
    async fn request_response<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<Response, ConnectionError> {
        let task_response = self.send_request(request).await?;
        let body = &mut &*task_response.body;
        Ok(Response::deserialize(task_response.opcode, body)?)
    }

    async fn get_options(&self) -> Result<Supported, ConnectionError> {
        match self.request_response(&Options).await? {
            Response::Supported(supported) => Ok(supported),
            Response::Error(err) => Err(ConnectionError::Db(err.error, err.reason)),
            _ => Err(ConnectionError::UnexpectedResponse("OPTIONS")),
        }
    }

    async fn startup(
        &self,
        options: HashMap<String, String>,
        config: &ConnectionConfig,
    ) -> Result<(), ConnectionError> {
        match self.request_response(&Startup { options }).await? {
            Response::Ready => Ok(()),
            Response::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate, config).await
            }
            Response::Error(err) => Err(ConnectionError::Db(err.error, err.reason)),
            _ => Err(ConnectionError::UnexpectedResponse("STARTUP")),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
        config: &ConnectionConfig,
    ) -> Result<(), ConnectionError> {
        let Some(credentials) = &config.credentials else {
            return Err(ConnectionError::MissingCredentials(
                authenticate.authenticator_name.clone(),
            ));
        };

        let auth_response =
            AuthResponse::plain(&credentials.username, &credentials.password);
        match self.request_response(&auth_response).await? {
            Response::AuthSuccess => Ok(()),
            Response::Error(err) => Err(ConnectionError::Db(err.error, err.reason)),
            _ => Err(ConnectionError::UnexpectedResponse("AUTH_RESPONSE")),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), ConnectionError> {
        // Trusted to be alphanumeric, so no injection is possible here.
        let query_str = if keyspace_name.is_case_sensitive {
            format!("USE \"{}\"", keyspace_name.as_str())
        } else {
            format!("USE {}", keyspace_name.as_str())
        };

        match self
            .request_response(&Query {
                contents: &query_str,
            })
            .await?
        {
            Response::Result => Ok(()),
            Response::Error(err) => Err(ConnectionError::Db(err.error, err.reason)),
            _ => Err(ConnectionError::UnexpectedResponse("QUERY")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: ConnectionConfig,
        stream: TcpStream,
        submit_receiver: mpsc::UnboundedReceiver<Task>,
        submit_sender: mpsc::UnboundedSender<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        stats: Arc<ConnectionStats>,
        closing: Arc<AtomicBool>,
        shutdown_requested: Arc<Notify>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // The handler map is shared between the loops below, which all run
        // on this single task, so the mutex is never contended. It exists
        // only because RefCell would make the future !Sync.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &stats,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            submit_receiver,
        );
        let k = Self::keepaliver(submit_sender, &stats, &config, node_address);
        let c = Self::wait_for_shutdown(&shutdown_requested);

        let result = futures::try_join!(r, w, k, c);

        closing.store(true, Ordering::Relaxed);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        // Respond to all pending requests with the error.
        let response_handlers = handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in response_handlers {
            // Ignore sending errors: the request may have been dropped.
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors, notify them.
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        stats: &ConnectionStats,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            stats.record_traffic();

            if params.stream < 0 {
                // Negative streams are reserved for server-generated events,
                // which this connection never registers for.
                trace!("Ignoring server event frame on stream {}", params.stream);
                continue;
            }

            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            // We are guaranteed that the handler map is not locked by anybody
            // else, so we can do try_lock().unwrap().
            let handler = {
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };

            match handler {
                Some(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                None => {
                    // Unsolicited frame. This should not happen and indicates
                    // a bug either in the driver, or in the database.
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(
                        BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into()
                    );
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        // Same as above: the lock is never contended.
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                warn!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::UnboundedReceiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel is dropped too, this loop ends and the whole worker stops.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                if let Some(stream_id) =
                    Self::alloc_stream_id(handler_map, task.response_handler)
                {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    let req_data: &[u8] = req.get_data();
                    total_sent += req_data.len();
                    num_requests += 1;
                    write_half
                        .write_all(req_data)
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                }
                match task_receiver.try_recv() {
                    Ok(t) => task = t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    async fn keepaliver(
        submit_sender: mpsc::UnboundedSender<Task>,
        stats: &Arc<ConnectionStats>,
        config: &ConnectionConfig,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = config.keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Some(idle_timeout) = config.idle_timeout {
                if stats.time_since_last_traffic() > idle_timeout {
                    warn!(
                        "Connection to node {} defunct: no server traffic for over {:?}",
                        node_address, idle_timeout
                    );
                    return Err(BrokenConnectionErrorKind::IdleTimeout(idle_timeout).into());
                }
            }

            let (task, response_receiver) = prepare_task(&Options, stats)
                .map_err(|_| -> BrokenConnectionError {
                    BrokenConnectionErrorKind::ChannelClosed.into()
                })?;
            if submit_sender.send(task).is_err() {
                return Err(BrokenConnectionErrorKind::ChannelClosed.into());
            }

            let keepalive_response = async {
                let response = response_receiver.await.map_err(|_| -> BrokenConnectionError {
                    BrokenConnectionErrorKind::ChannelClosed.into()
                })?;
                response.map_err(|err| -> BrokenConnectionError {
                    BrokenConnectionErrorKind::KeepaliveRequestError(Box::new(err)).into()
                })
            };

            let result = if let Some(keepalive_timeout) = config.keepalive_timeout {
                match tokio::time::timeout(keepalive_timeout, keepalive_response).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout.into());
                    }
                }
            } else {
                keepalive_response.await
            };
            if let Err(err) = result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    node_address, err
                );
                return Err(err);
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                node_address
            );
        }
    }

    async fn wait_for_shutdown(
        shutdown_requested: &Notify,
    ) -> Result<(), BrokenConnectionError> {
        shutdown_requested.notified().await;
        Err(BrokenConnectionErrorKind::ClosedOnRequest.into())
    }
}

fn prepare_task<R: SerializableRequest>(
    request: &R,
    stats: &Arc<ConnectionStats>,
) -> Result<(Task, ResponseReceiver), FrameError> {
    let serialized_request = SerializedRequest::make(request)?;
    let (response_sender, response_receiver) = oneshot::channel();
    let task = Task {
        serialized_request,
        response_handler: ResponseHandler {
            response_sender,
            _inflight: InflightGuard::new(stats.clone()),
        },
    };
    Ok((task, response_receiver))
}

/// Opens a connection and performs its setup on the CQL level:
/// - exchanges OPTIONS/SUPPORTED and learns the node's shard layout,
/// - performs the STARTUP handshake, authenticating if the server demands it,
/// - switches to the given keyspace, if any.
pub async fn open_connection(
    connect_address: SocketAddr,
    source_port: Option<u16>,
    config: &ConnectionConfig,
    keyspace: Option<&VerifiedKeyspaceName>,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    /* Set up the connection on the TCP level and start the frame router. */
    let (mut connection, error_receiver) =
        Connection::new(connect_address, source_port, config).await?;

    /* Get the options SUPPORTED by the node. */
    let supported = connection.get_options().await?;

    // If this is a sharded node, the SUPPORTED frame described its layout.
    connection.shard_info = match ShardingInfo::parse_from_supported(&supported.options) {
        Ok(info) => Some(info),
        Err(ShardingError::NoShardInfo) => {
            debug!(
                "[{}] No sharding information received. Proceeding with no sharding info.",
                connect_address
            );
            None
        }
        Err(e) => {
            warn!(
                "[{}] Error while parsing sharding information: {}. Proceeding with no sharding info.",
                connect_address, e
            );
            None
        }
    };

    /* Send the STARTUP frame, authenticating if requested. */
    let options = HashMap::from([("CQL_VERSION".to_owned(), "3.0.0".to_owned())]);
    connection.startup(options, config).await?;

    /* Switch to the keyspace the pool is configured with. */
    if let Some(keyspace_name) = keyspace {
        connection.use_keyspace(keyspace_name).await?;
    }

    Ok((connection, error_receiver))
}

async fn connect_with_source_ip_and_port(
    connect_address: SocketAddr,
    source_ip: Option<IpAddr>,
    source_port: Option<u16>,
) -> Result<TcpStream, std::io::Error> {
    // Binding to port 0 is equivalent to choosing a random ephemeral port.
    let source_port = source_port.unwrap_or(0);

    match connect_address {
        SocketAddr::V4(_) => {
            // If source_ip is not provided, bind to INADDR_ANY.
            let source_ipv4 = source_ip.unwrap_or(Ipv4Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::new(source_ipv4, source_port))?;
            Ok(socket.connect(connect_address).await?)
        }
        SocketAddr::V6(_) => {
            // If source_ip is not provided, bind to in6addr_any.
            let source_ipv6 = source_ip.unwrap_or(Ipv6Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v6()?;
            socket.bind(SocketAddr::new(source_ipv6, source_port))?;
            Ok(socket.connect(connect_address).await?)
        }
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            assert!(prev_handler.is_none());
            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    fn lookup(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        self.stream_set.free(stream_id);
        self.handlers.remove(&stream_id)
    }

    // Retrieves the map of handlers, used after the connection breaks and we
    // have to respond to all of them with an error.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = (i16::MAX as usize + 1) / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// This type can only hold a valid keyspace name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // "Keyspace names can have up to 48 alphanumeric characters and contain
    // underscores; only letters and numbers are supported as the first
    // character." The servers also accept an underscore as the first
    // character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len = keyspace_name.chars().count(); // Only ascii allowed, so it's equal to .len()
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::VerifiedKeyspaceName;
    use crate::errors::BadKeyspaceName;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn test_verified_keyspace_name_validation() {
        setup_tracing();

        assert_matches!(VerifiedKeyspaceName::new("ks_1".to_string(), false), Ok(_));
        assert_matches!(
            VerifiedKeyspaceName::new("_leading_underscore".to_string(), false),
            Ok(_)
        );
        assert_matches!(
            VerifiedKeyspaceName::new(String::new(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("ks\"; DROP KEYSPACE ks".to_string(), true),
            Err(BadKeyspaceName::IllegalCharacter(_, '"'))
        );
    }
}
