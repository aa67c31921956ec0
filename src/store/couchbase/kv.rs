use std::{collections::HashMap, fmt, future::Future, io, sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufStream},
    net::TcpStream,
    sync::{Mutex, RwLock},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::Config,
    store::{Keyspace, StoreError},
};

use super::protocol::{
    collection_key, decode_features, hello_value, increment_extras, sasl_plain, store_extras,
    vbucket_for, Feature, Opcode, Request, Response, ResponseHeader, Status, DATATYPE_JSON,
    DATATYPE_RAW, HEADER_LEN, JSON_COMMON_FLAGS,
};

const AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// vBuckets of a bucket when the cluster config doesn't say otherwise.
const DEFAULT_VBUCKETS: usize = 1024;

/// A collection created through the management API takes a moment to reach the data service.
const COLLECTION_LOOKUP_ATTEMPTS: u32 = 10;
const COLLECTION_LOOKUP_DELAY: Duration = Duration::from_millis(200);

/// Stands for the host that served the cluster config in its server list.
const HOST_PLACEHOLDER: &str = "$HOST";

/// Data service endpoint of one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `host:port` entry of a server list.
    fn from_server_list(entry: &str, config_host: &str) -> Option<Self> {
        let (host, port) = entry.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host == HOST_PLACEHOLDER {
            config_host
        } else {
            host
        };
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Deserialize)]
struct ClusterConfig {
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<VbucketServerMap>,
}

#[derive(Deserialize)]
struct VbucketServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    /// Per vBucket, the index of the active node followed by the replicas. `-1` when unassigned.
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i64>>,
}

/// Which node owns which vBucket.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Routing {
    servers: Vec<NodeAddress>,
    /// Index into `servers` of the active node of every vBucket.
    masters: Vec<Option<usize>>,
}

impl Routing {
    fn single(node: NodeAddress) -> Self {
        Self {
            servers: vec![node],
            masters: vec![Some(0); DEFAULT_VBUCKETS],
        }
    }

    /// `None` unless `raw` is a cluster config with a usable vBucket map.
    fn from_config(raw: &[u8], config_host: &str) -> Option<Self> {
        let map = serde_json::from_slice::<ClusterConfig>(raw)
            .ok()?
            .vbucket_server_map?;
        if map.vbucket_map.is_empty() || map.vbucket_map.len() > usize::from(u16::MAX) {
            return None;
        }

        let servers = map
            .server_list
            .iter()
            .map(|entry| NodeAddress::from_server_list(entry, config_host))
            .collect::<Option<Vec<_>>>()?;
        let masters = map
            .vbucket_map
            .iter()
            .map(|chain| {
                chain
                    .first()
                    .and_then(|master| usize::try_from(*master).ok())
                    .filter(|master| *master < servers.len())
            })
            .collect();
        Some(Self { servers, masters })
    }

    fn route(&self, key: &str) -> Result<(u16, NodeAddress), StoreError> {
        // Bounded by `from_config`.
        let vbucket = vbucket_for(key, self.masters.len() as u16);
        self.masters
            .get(usize::from(vbucket))
            .copied()
            .flatten()
            .and_then(|master| self.servers.get(master))
            .map(|node| (vbucket, node.clone()))
            .ok_or_else(|| {
                StoreError::Unavailable(format!("vbucket {vbucket} has no active node"))
            })
    }
}

/// One connection to the data service of a node. Requests are strictly sequential.
struct Connection {
    stream: BufStream<TcpStream>,
    next_opaque: u32,
    buffer: BytesMut,
    /// Set when an exchange was interrupted half way, the stream can't be trusted afterwards.
    broken: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
            next_opaque: 0,
            buffer: BytesMut::with_capacity(1024),
            broken: false,
        }
    }

    /// Whether another request may be written. Catches a peer that hung up while the connection
    /// sat idle, before anything is sent.
    fn is_reusable(&self) -> bool {
        if self.broken {
            return false;
        }

        let mut probe = [0u8; 1];
        match self.stream.get_ref().try_read(&mut probe) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Ok(0) => {
                debug!("Connection closed by the server");
                false
            }
            Ok(_) => {
                warn!("Unsolicited data from the server");
                false
            }
            Err(e) => {
                debug!("Connection failed while idle: {e}");
                false
            }
        }
    }

    async fn round_trip(&mut self, mut request: Request) -> Result<Response, StoreError> {
        if self.broken {
            return Err(StoreError::Unavailable(
                "connection was interrupted earlier".into(),
            ));
        }
        self.broken = true;

        self.next_opaque = self.next_opaque.wrapping_add(1);
        request.opaque = self.next_opaque;

        self.buffer.clear();
        request.encode(&mut self.buffer)?;
        self.stream.write_all(&self.buffer).await?;
        self.stream.flush().await?;

        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let header = ResponseHeader::decode(&header)?;

        let mut body = vec![0u8; header.body_len as usize];
        self.stream.read_exact(&mut body).await?;
        let response = Response::decode(header, Bytes::from(body))?;

        if response.opaque != request.opaque || response.opcode != request.opcode.as_u8() {
            return Err(StoreError::Protocol(format!(
                "response {:?}/{} doesn't match request {:?}/{}",
                response.opcode, response.opaque, request.opcode, request.opaque
            )));
        }
        self.broken = false;
        Ok(response)
    }
}

/// What it takes to open an authenticated connection to any node of the bucket.
pub struct Handshake {
    pub username: String,
    pub password: String,
    pub bucket: String,
    pub timeout: Duration,
}

impl Handshake {
    /// Connects and authenticates. Returns whether documents may be flagged as JSON.
    async fn open(&self, node: &NodeAddress) -> Result<(Connection, bool), StoreError> {
        with_timeout(self.timeout, async {
            let stream = TcpStream::connect((node.host.as_str(), node.port)).await?;
            stream.set_nodelay(true)?;

            let mut connection = Connection::new(stream);
            let json = hello(&mut connection).await?;
            authenticate(&mut connection, &self.username, &self.password).await?;
            select_bucket(&mut connection, &self.bucket).await?;
            debug!("Opened connection to {node}");
            Ok((connection, json))
        })
        .await
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// Client of the Couchbase data service for a single bucket.
///
/// Requests go to the node owning the key's vBucket, one lazily opened connection per node. A
/// connection found closed or interrupted is replaced before the next request is written.
pub struct KvClient {
    handshake: Handshake,
    seed: NodeAddress,
    routing: RwLock<Routing>,
    nodes: Mutex<HashMap<NodeAddress, Slot>>,
    collection_ids: Mutex<HashMap<Keyspace, u32>>,
    json: bool,
}

impl KvClient {
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let seed = NodeAddress::new(config.endpoint.host.clone(), config.endpoint.kv_port);
        let handshake = Handshake {
            username: config.username.clone(),
            password: config.password.clone(),
            bucket: config.bucket.clone(),
            timeout: config.timeout,
        };
        Self::open(seed, handshake).await
    }

    #[instrument(skip_all, fields(seed = %seed, bucket = %handshake.bucket))]
    pub async fn open(seed: NodeAddress, handshake: Handshake) -> Result<Self, StoreError> {
        let (mut connection, json) = handshake.open(&seed).await?;

        let routing = match with_timeout(
            handshake.timeout,
            fetch_routing(&mut connection, &seed.host),
        )
        .await
        {
            Ok(Some(routing)) => routing,
            Ok(None) => {
                warn!("Cluster config has no vbucket map, sending everything to {seed}");
                Routing::single(seed.clone())
            }
            Err(e) => {
                warn!("Cluster config unavailable, sending everything to {seed}: {e}");
                Routing::single(seed.clone())
            }
        };
        debug!(
            "Bucket {} has {} vbuckets on {} nodes",
            handshake.bucket,
            routing.masters.len(),
            routing.servers.len()
        );

        let nodes = HashMap::from([(seed.clone(), Arc::new(Mutex::new(Some(connection))))]);
        Ok(Self {
            handshake,
            seed,
            routing: RwLock::new(routing),
            nodes: Mutex::new(nodes),
            collection_ids: Mutex::new(HashMap::new()),
            json,
        })
    }

    async fn execute(&self, node: &NodeAddress, request: Request) -> Result<Response, StoreError> {
        let slot = self
            .nodes
            .lock()
            .await
            .entry(node.clone())
            .or_default()
            .clone();
        let mut slot = slot.lock().await;

        let connection = match slot.take() {
            Some(connection) if connection.is_reusable() => connection,
            stale => {
                if stale.is_some() {
                    info!("Reconnecting to {node}");
                }
                self.handshake.open(node).await?.0
            }
        };
        let connection = slot.insert(connection);
        with_timeout(self.handshake.timeout, connection.round_trip(request)).await
    }

    async fn collection_id(&self, keyspace: &Keyspace) -> Result<u32, StoreError> {
        if let Some(id) = self.collection_ids.lock().await.get(keyspace) {
            return Ok(*id);
        }

        let mut attempt = 1;
        let id = loop {
            let request = Request::new(Opcode::GetCollectionId).with_value(keyspace.to_string());
            let response = self.execute(&self.seed, request).await?;
            match response.status {
                Status::Success if response.extras.len() >= 12 => {
                    let mut extras = response.extras;
                    let manifest = extras.get_u64();
                    let id = extras.get_u32();
                    debug!("Collection {keyspace} has id {id} in manifest {manifest}");
                    break id;
                }
                Status::UnknownCollection | Status::UnknownScope
                    if attempt < COLLECTION_LOOKUP_ATTEMPTS =>
                {
                    debug!("Collection {keyspace} is not known yet, attempt {attempt}");
                    attempt += 1;
                    tokio::time::sleep(COLLECTION_LOOKUP_DELAY).await;
                }
                status => return Err(status_error(status, keyspace, "", &response)),
            }
        };

        self.collection_ids
            .lock()
            .await
            .insert(keyspace.clone(), id);
        Ok(id)
    }

    /// Sends `request` for `key` to the node owning its vBucket.
    async fn dispatch(
        &self,
        keyspace: &Keyspace,
        key: &str,
        request: Request,
    ) -> Result<Response, StoreError> {
        let collection = self.collection_id(keyspace).await?;
        let request = request.with_key(collection_key(collection, key));

        let mut refreshed = false;
        loop {
            let (vbucket, node) = self.routing.read().await.route(key)?;
            let response = self
                .execute(&node, request.clone().with_vbucket(vbucket))
                .await?;
            if response.status != Status::NotMyVbucket || refreshed {
                return Ok(response);
            }
            // Rejected without being applied, so sending it again is safe.
            debug!("{node} no longer owns vbucket {vbucket}");
            refreshed = true;
            self.refresh_routing(&node, &response).await;
        }
    }

    /// Replaces the routing with the config attached to a rejection, or asks the seed node.
    async fn refresh_routing(&self, node: &NodeAddress, rejected: &Response) {
        let routing = match Routing::from_config(&rejected.value, &node.host) {
            Some(routing) => Some(routing),
            None => match self
                .execute(&self.seed, Request::new(Opcode::GetClusterConfig))
                .await
            {
                Ok(response) if response.status == Status::Success => {
                    Routing::from_config(&response.value, &self.seed.host)
                }
                Ok(response) => {
                    warn!("Cluster config unavailable: {:?}", response.status);
                    None
                }
                Err(e) => {
                    warn!("Cluster config unavailable: {e}");
                    None
                }
            },
        };

        if let Some(routing) = routing {
            info!("Updated vbucket map, {} nodes", routing.servers.len());
            *self.routing.write().await = routing;
        }
    }

    pub async fn increment(
        &self,
        keyspace: &Keyspace,
        key: &str,
        delta: u64,
        initial: u64,
    ) -> Result<u64, StoreError> {
        let request = Request::new(Opcode::Increment).with_extras(increment_extras(delta, initial));
        let response = self.dispatch(keyspace, key, request).await?;
        match response.status {
            Status::Success if response.value.len() == 8 => Ok(response.value.clone().get_u64()),
            Status::Success => Err(StoreError::Protocol(format!(
                "counter value of {} bytes",
                response.value.len()
            ))),
            status => Err(status_error(status, keyspace, key, &response)),
        }
    }

    pub async fn store(
        &self,
        opcode: Opcode,
        keyspace: &Keyspace,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let datatype = if self.json { DATATYPE_JSON } else { DATATYPE_RAW };
        let request = Request::new(opcode)
            .with_extras(store_extras(JSON_COMMON_FLAGS))
            .with_datatype(datatype)
            .with_value(value);
        let response = self.dispatch(keyspace, key, request).await?;
        match response.status {
            Status::Success => Ok(()),
            status => Err(status_error(status, keyspace, key, &response)),
        }
    }

    pub async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let response = self
            .dispatch(keyspace, key, Request::new(Opcode::Get))
            .await?;
        match response.status {
            Status::Success => Ok(Some(response.value.to_vec())),
            Status::KeyNotFound => Ok(None),
            status => Err(status_error(status, keyspace, key, &response)),
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| StoreError::Unavailable(format!("timed out after {timeout:?}")))?
}

/// Negotiates features. Returns whether documents may be flagged as JSON.
async fn hello(connection: &mut Connection) -> Result<bool, StoreError> {
    let wanted = [
        Feature::Xerror,
        Feature::SelectBucket,
        Feature::Json,
        Feature::Collections,
    ];
    let request = Request::new(Opcode::Hello)
        .with_key(AGENT)
        .with_value(hello_value(&wanted));
    let response = connection.round_trip(request).await?;
    if response.status != Status::Success {
        return Err(StoreError::Protocol(format!(
            "HELLO failed with {:?}",
            response.status
        )));
    }

    let enabled = decode_features(&response.value);
    debug!("Server enabled features {enabled:?}");
    if !enabled.contains(&Feature::Collections.as_u16()) {
        return Err(StoreError::Protocol(
            "server does not support collections".into(),
        ));
    }
    Ok(enabled.contains(&Feature::Json.as_u16()))
}

async fn authenticate(
    connection: &mut Connection,
    username: &str,
    password: &str,
) -> Result<(), StoreError> {
    let request = Request::new(Opcode::SaslAuth)
        .with_key("PLAIN")
        .with_value(sasl_plain(username, password));
    let response = connection.round_trip(request).await?;
    match response.status {
        Status::Success => Ok(()),
        Status::AuthError => Err(StoreError::PermissionDenied(format!(
            "authentication failed for '{username}'"
        ))),
        status => Err(StoreError::Protocol(format!(
            "SASL_AUTH failed with {status:?}"
        ))),
    }
}

async fn select_bucket(connection: &mut Connection, bucket: &str) -> Result<(), StoreError> {
    let request = Request::new(Opcode::SelectBucket).with_key(bucket.to_owned());
    let response = connection.round_trip(request).await?;
    match response.status {
        Status::Success => Ok(()),
        Status::AccessDenied | Status::KeyNotFound | Status::NoBucket => Err(
            StoreError::PermissionDenied(format!("bucket '{bucket}' is missing or not accessible")),
        ),
        status => Err(StoreError::Protocol(format!(
            "SELECT_BUCKET failed with {status:?}"
        ))),
    }
}

/// Reads the vBucket map from the cluster config of the node behind `connection`.
async fn fetch_routing(
    connection: &mut Connection,
    host: &str,
) -> Result<Option<Routing>, StoreError> {
    let response = connection
        .round_trip(Request::new(Opcode::GetClusterConfig))
        .await?;
    if response.status != Status::Success {
        debug!("GET_CLUSTER_CONFIG answered {:?}", response.status);
        return Ok(None);
    }
    Ok(Routing::from_config(&response.value, host))
}

fn status_error(status: Status, keyspace: &Keyspace, key: &str, response: &Response) -> StoreError {
    match status {
        Status::KeyExists => StoreError::KeyExists(key.to_owned()),
        Status::DeltaBadValue => StoreError::BadValue(key.to_owned()),
        Status::UnknownCollection | Status::UnknownScope => {
            StoreError::UnknownCollection(keyspace.clone())
        }
        Status::AuthError | Status::AccessDenied => {
            StoreError::PermissionDenied(format!("access to {keyspace} denied"))
        }
        Status::NotMyVbucket | Status::Busy | Status::TemporaryFailure => StoreError::Unavailable(
            format!("{status:?} for '{key}' in {keyspace}"),
        ),
        status => StoreError::Protocol(format!(
            "{status:?} for '{key}' in {keyspace}: {}",
            response.error_context()
        )),
    }
}
