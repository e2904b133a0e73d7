//! An in-memory client implementation.
//!
//! Serves as the locally compiled client in tests and embedded simulations:
//! a [`SimCluster`] models one cluster (key space, read version, announced
//! protocol version), and any number of [`SimClient`]s at arbitrary
//! protocol versions can be pointed at it. A client only reaches the
//! cluster while their normalized protocol versions match, which is exactly
//! the situation the multi-version layer exists to manage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::error::{codes, ClientError, ClientResult};
use crate::options::{
    ConflictRangeKind, DatabaseOption, MutationType, MutationType::*, NetworkOption,
    TransactionOption,
};
use crate::traits::{
    ready_err, ready_ok, ClientApi, ClientDatabase, ClientTransaction, CompletionHook, KeySelector,
    KvFuture, KeyValue, RangeLimits, RangeResult,
};
use crate::version::{format_client_version, ProtocolVersion, MAX_SUPPORTED_API_VERSION};

/// Shared cluster state.
pub struct SimCluster {
    protocol: watch::Sender<ProtocolVersion>,
    read_version: watch::Sender<i64>,
    kv: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    reachable: AtomicBool,
}

impl SimCluster {
    pub fn new(protocol: ProtocolVersion) -> Arc<SimCluster> {
        let (protocol, _) = watch::channel(protocol);
        let (read_version, _) = watch::channel(1);
        Arc::new(SimCluster {
            protocol,
            read_version,
            kv: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
        })
    }

    /// Upgrade or downgrade the cluster; version monitors observe this.
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.protocol.send_replace(version);
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        *self.protocol.borrow()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Committed value of `key`, for test assertions.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.lock().get(key).cloned()
    }

    pub fn read_version(&self) -> i64 {
        *self.read_version.borrow()
    }
}

/// Builder for a [`SimClient`] at a given protocol version.
pub struct SimClientBuilder {
    cluster: Arc<SimCluster>,
    protocol: ProtocolVersion,
    supports_protocol_query: bool,
    supports_versionstamp: bool,
    unsupported_database_options: Vec<DatabaseOption>,
}

impl SimClientBuilder {
    /// Model an older release that cannot answer server-protocol queries.
    pub fn without_protocol_query(mut self) -> Self {
        self.supports_protocol_query = false;
        self
    }

    /// Model an older release without versionstamp support.
    pub fn without_versionstamp(mut self) -> Self {
        self.supports_versionstamp = false;
        self
    }

    /// Make the client reject a database option with `UnsupportedOption`.
    pub fn with_unsupported_database_option(mut self, option: DatabaseOption) -> Self {
        self.unsupported_database_options.push(option);
        self
    }

    pub fn build(self) -> Arc<SimClient> {
        let (major, minor) = (
            (self.protocol.0 >> 32) & 0xff,
            (self.protocol.0 >> 24) & 0xff,
        );
        Arc::new(SimClient {
            cluster: self.cluster,
            protocol: self.protocol,
            semver: format!("{major}.{minor}.0"),
            supports_protocol_query: self.supports_protocol_query,
            supports_versionstamp: self.supports_versionstamp,
            unsupported_database_options: self.unsupported_database_options,
            api_version: AtomicI32::new(0),
            network_setup: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            stop_state: Arc::new((Mutex::new(false), Condvar::new())),
            network_options: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            transactions: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// One client release, pointed at a [`SimCluster`].
pub struct SimClient {
    cluster: Arc<SimCluster>,
    protocol: ProtocolVersion,
    semver: String,
    supports_protocol_query: bool,
    supports_versionstamp: bool,
    unsupported_database_options: Vec<DatabaseOption>,
    api_version: AtomicI32,
    network_setup: AtomicBool,
    stop_calls: AtomicUsize,
    stop_state: Arc<(Mutex<bool>, Condvar)>,
    network_options: Mutex<Vec<(NetworkOption, Option<Vec<u8>>)>>,
    hooks: Mutex<Vec<CompletionHook>>,
    // Every transaction this client ever created, in creation order; lets
    // tests inspect which options reached the inner transactions.
    transactions: Arc<Mutex<Vec<Arc<SimTransaction>>>>,
}

impl SimClient {
    pub fn builder(cluster: Arc<SimCluster>, protocol: ProtocolVersion) -> SimClientBuilder {
        SimClientBuilder {
            cluster,
            protocol,
            supports_protocol_query: true,
            supports_versionstamp: true,
            unsupported_database_options: Vec::new(),
        }
    }

    /// Network options this client has been handed, in order.
    pub fn recorded_network_options(&self) -> Vec<(NetworkOption, Option<Vec<u8>>)> {
        self.network_options.lock().clone()
    }

    /// Transactions created through this client, in creation order.
    pub fn created_transactions(&self) -> Vec<Arc<SimTransaction>> {
        self.transactions.lock().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn network_stopped(&self) -> bool {
        *self.stop_state.0.lock()
    }
}

impl ClientApi for SimClient {
    fn select_api_version(&self, version: i32) -> ClientResult<()> {
        if version > MAX_SUPPORTED_API_VERSION {
            return Err(ClientError::ApiVersionNotSupported(version));
        }
        self.api_version.store(version, Ordering::SeqCst);
        Ok(())
    }

    fn client_version(&self) -> String {
        format_client_version(&self.semver, "sim", self.protocol)
    }

    fn set_network_option(&self, option: NetworkOption, value: Option<&[u8]>) -> ClientResult<()> {
        self.network_options
            .lock()
            .push((option, value.map(|v| v.to_vec())));
        Ok(())
    }

    fn setup_network(&self) -> ClientResult<()> {
        self.network_setup.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_network(&self) -> ClientResult<()> {
        let (stopped, condvar) = &*self.stop_state;
        let mut guard = stopped.lock();
        while !*guard {
            condvar.wait(&mut guard);
        }
        drop(guard);
        for hook in self.hooks.lock().iter() {
            hook();
        }
        Ok(())
    }

    fn stop_network(&self) -> ClientResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let (stopped, condvar) = &*self.stop_state;
        *stopped.lock() = true;
        condvar.notify_all();
        Ok(())
    }

    fn create_database(&self, _cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>> {
        Ok(Arc::new(SimDatabase {
            cluster: self.cluster.clone(),
            protocol: self.protocol,
            supports_protocol_query: self.supports_protocol_query,
            supports_versionstamp: self.supports_versionstamp,
            unsupported_database_options: self.unsupported_database_options.clone(),
            options: Mutex::new(Vec::new()),
            transactions: self.transactions.clone(),
        }))
    }

    fn add_network_thread_completion_hook(&self, hook: CompletionHook) -> ClientResult<()> {
        self.hooks.lock().push(hook);
        Ok(())
    }
}

pub struct SimDatabase {
    cluster: Arc<SimCluster>,
    protocol: ProtocolVersion,
    supports_protocol_query: bool,
    supports_versionstamp: bool,
    unsupported_database_options: Vec<DatabaseOption>,
    options: Mutex<Vec<(DatabaseOption, Option<Vec<u8>>)>>,
    transactions: Arc<Mutex<Vec<Arc<SimTransaction>>>>,
}

impl SimDatabase {
    pub fn recorded_options(&self) -> Vec<(DatabaseOption, Option<Vec<u8>>)> {
        self.options.lock().clone()
    }
}

impl ClientDatabase for SimDatabase {
    fn create_transaction(&self) -> ClientResult<Arc<dyn ClientTransaction>> {
        let transaction = Arc::new(SimTransaction {
            cluster: self.cluster.clone(),
            protocol: self.protocol,
            supports_versionstamp: self.supports_versionstamp,
            options: Mutex::new(Vec::new()),
            writes: Mutex::new(BTreeMap::new()),
            cancelled: AtomicBool::new(false),
            committed_version: AtomicI64::new(-1),
        });
        self.transactions.lock().push(transaction.clone());
        Ok(transaction)
    }

    fn set_option(&self, option: DatabaseOption, value: Option<&[u8]>) -> ClientResult<()> {
        if self.unsupported_database_options.contains(&option) {
            return Err(ClientError::UnsupportedOption);
        }
        self.options.lock().push((option, value.map(|v| v.to_vec())));
        Ok(())
    }

    fn get_main_thread_busyness(&self) -> f64 {
        0.0
    }

    fn get_server_protocol(&self, expected: Option<ProtocolVersion>) -> KvFuture<ProtocolVersion> {
        if !self.supports_protocol_query {
            return ready_err(ClientError::UnsupportedOperation);
        }
        let mut rx = self.cluster.protocol.subscribe();
        Box::pin(async move {
            loop {
                let current = *rx.borrow_and_update();
                match expected {
                    Some(expected) if current == expected => {
                        if rx.changed().await.is_err() {
                            return Err(ClientError::Client(codes::TIMED_OUT));
                        }
                    }
                    _ => return Ok(current),
                }
            }
        })
    }

    fn reboot_worker(&self, _address: &[u8], _check: bool, _duration_secs: i32) -> KvFuture<i64> {
        ready_ok(0)
    }

    fn force_recovery_with_data_loss(&self, _dcid: &[u8]) -> KvFuture<()> {
        ready_ok(())
    }

    fn create_snapshot(&self, _uid: &[u8], _command: &[u8]) -> KvFuture<()> {
        ready_ok(())
    }
}

pub struct SimTransaction {
    cluster: Arc<SimCluster>,
    protocol: ProtocolVersion,
    supports_versionstamp: bool,
    options: Mutex<Vec<(TransactionOption, Option<Vec<u8>>)>>,
    // Buffered mutations: value to write, or None for a clear.
    writes: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    cancelled: AtomicBool,
    committed_version: AtomicI64,
}

impl SimTransaction {
    /// Options applied to this transaction, in order. Used by tests to
    /// verify sticky-option replay.
    pub fn recorded_options(&self) -> Vec<(TransactionOption, Option<Vec<u8>>)> {
        self.options.lock().clone()
    }

    fn check_cluster(&self) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::TransactionCancelled);
        }
        if !self.cluster.reachable.load(Ordering::SeqCst) {
            return Err(ClientError::Client(codes::TIMED_OUT));
        }
        // An incompatible wire protocol looks like an unreachable cluster
        // from the client's point of view.
        if self.cluster.protocol_version().normalized() != self.protocol.normalized() {
            return Err(ClientError::Client(codes::TIMED_OUT));
        }
        Ok(())
    }

    /// Committed state overlaid with this transaction's own writes.
    fn merged_view(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut view = self.cluster.kv.lock().clone();
        for (key, write) in self.writes.lock().iter() {
            match write {
                Some(value) => {
                    view.insert(key.clone(), value.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        view
    }

    fn resolve_selector(view: &BTreeMap<Vec<u8>, Vec<u8>>, selector: &KeySelector) -> usize {
        let keys: Vec<&Vec<u8>> = view.keys().collect();
        let base = if selector.or_equal {
            keys.partition_point(|k| k.as_slice() <= selector.key.as_slice())
        } else {
            keys.partition_point(|k| k.as_slice() < selector.key.as_slice())
        };
        (base as i64 + selector.offset as i64 - 1).clamp(0, keys.len() as i64) as usize
    }
}

impl ClientTransaction for SimTransaction {
    fn set_read_version(&self, _version: i64) {}

    fn get_read_version(&self) -> KvFuture<i64> {
        match self.check_cluster() {
            Ok(()) => ready_ok(self.cluster.read_version()),
            Err(err) => ready_err(err),
        }
    }

    fn get(&self, key: &[u8], _snapshot: bool) -> KvFuture<Option<Vec<u8>>> {
        match self.check_cluster() {
            Ok(()) => ready_ok(self.merged_view().get(key).cloned()),
            Err(err) => ready_err(err),
        }
    }

    fn get_key(&self, selector: &KeySelector, _snapshot: bool) -> KvFuture<Vec<u8>> {
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        let view = self.merged_view();
        let index = Self::resolve_selector(&view, selector);
        ready_ok(view.keys().nth(index).cloned().unwrap_or_else(|| b"\xff".to_vec()))
    }

    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        _snapshot: bool,
        reverse: bool,
    ) -> KvFuture<RangeResult> {
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        let view = self.merged_view();
        let start = Self::resolve_selector(&view, begin);
        let stop = Self::resolve_selector(&view, end).max(start);
        let mut kvs: Vec<KeyValue> = view
            .iter()
            .skip(start)
            .take(stop - start)
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        if reverse {
            kvs.reverse();
        }
        let mut more = false;
        if limits.limit > 0 && kvs.len() > limits.limit as usize {
            kvs.truncate(limits.limit as usize);
            more = true;
        }
        ready_ok(RangeResult { kvs, more })
    }

    fn get_addresses_for_key(&self, _key: &[u8]) -> KvFuture<Vec<String>> {
        match self.check_cluster() {
            Ok(()) => ready_ok(vec!["127.0.0.1:4500".to_string()]),
            Err(err) => ready_err(err),
        }
    }

    fn get_versionstamp(&self) -> KvFuture<Vec<u8>> {
        if !self.supports_versionstamp {
            return ready_err(ClientError::UnsupportedOperation);
        }
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        let mut stamp = self.cluster.read_version().to_be_bytes().to_vec();
        stamp.extend_from_slice(&[0, 0]);
        ready_ok(stamp)
    }

    fn get_estimated_range_size_bytes(&self, begin: &[u8], end: &[u8]) -> KvFuture<i64> {
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        let size: usize = self
            .merged_view()
            .range(begin.to_vec()..end.to_vec())
            .map(|(key, value)| key.len() + value.len())
            .sum();
        ready_ok(size as i64)
    }

    fn get_range_split_points(
        &self,
        begin: &[u8],
        end: &[u8],
        _chunk_size: i64,
    ) -> KvFuture<Vec<Vec<u8>>> {
        match self.check_cluster() {
            Ok(()) => ready_ok(vec![begin.to_vec(), end.to_vec()]),
            Err(err) => ready_err(err),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.writes
            .lock()
            .insert(key.to_vec(), Some(value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        self.writes.lock().insert(key.to_vec(), None);
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let doomed: Vec<Vec<u8>> = self
            .merged_view()
            .range(begin.to_vec()..end.to_vec())
            .map(|(key, _)| key.clone())
            .collect();
        let mut writes = self.writes.lock();
        for key in doomed {
            writes.insert(key, None);
        }
    }

    fn atomic_op(&self, key: &[u8], param: &[u8], operation: MutationType) {
        let current = self.merged_view().get(key).cloned();
        let next = apply_mutation(operation, current, param);
        self.writes.lock().insert(key.to_vec(), next);
    }

    fn watch(&self, key: &[u8]) -> KvFuture<()> {
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        let cluster = self.cluster.clone();
        let key = key.to_vec();
        let initial = cluster.get(&key);
        let mut rx = cluster.read_version.subscribe();
        Box::pin(async move {
            loop {
                if cluster.get(&key) != initial {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Client(codes::OPERATION_CANCELLED));
                }
            }
        })
    }

    fn add_conflict_range(
        &self,
        _begin: &[u8],
        _end: &[u8],
        _kind: ConflictRangeKind,
    ) -> ClientResult<()> {
        self.check_cluster()
    }

    fn commit(&self) -> KvFuture<()> {
        if let Err(err) = self.check_cluster() {
            return ready_err(err);
        }
        {
            let mut kv = self.cluster.kv.lock();
            for (key, write) in self.writes.lock().iter() {
                match write {
                    Some(value) => {
                        kv.insert(key.clone(), value.clone());
                    }
                    None => {
                        kv.remove(key);
                    }
                }
            }
        }
        let mut committed = 0;
        self.cluster.read_version.send_modify(|version| {
            *version += 1;
            committed = *version;
        });
        self.committed_version.store(committed, Ordering::SeqCst);
        ready_ok(())
    }

    fn get_committed_version(&self) -> ClientResult<i64> {
        Ok(self.committed_version.load(Ordering::SeqCst))
    }

    fn get_approximate_size(&self) -> KvFuture<i64> {
        let size: usize = self
            .writes
            .lock()
            .iter()
            .map(|(key, value)| key.len() + value.as_ref().map_or(0, |v| v.len()))
            .sum();
        ready_ok(size as i64)
    }

    fn set_option(&self, option: TransactionOption, value: Option<&[u8]>) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::TransactionCancelled);
        }
        self.options.lock().push((option, value.map(|v| v.to_vec())));
        Ok(())
    }

    fn on_error(&self, error: ClientError) -> KvFuture<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return ready_err(ClientError::TransactionCancelled);
        }
        if error.is_retryable() {
            self.writes.lock().clear();
            ready_ok(())
        } else {
            ready_err(error)
        }
    }

    fn reset(&self) {
        self.writes.lock().clear();
        self.committed_version.store(-1, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}

fn apply_mutation(
    operation: MutationType,
    current: Option<Vec<u8>>,
    param: &[u8],
) -> Option<Vec<u8>> {
    let existing = current.clone().unwrap_or_default();
    match operation {
        Add => Some(
            le_u64(&existing)
                .wrapping_add(le_u64(param))
                .to_le_bytes()
                .to_vec(),
        ),
        BitAnd => Some(bytewise(&existing, param, |a, b| a & b)),
        BitOr => Some(bytewise(&existing, param, |a, b| a | b)),
        BitXor => Some(bytewise(&existing, param, |a, b| a ^ b)),
        AppendIfFits => {
            let mut combined = existing;
            combined.extend_from_slice(param);
            Some(combined)
        }
        Max => Some(if le_u64(&existing) >= le_u64(param) {
            existing
        } else {
            param.to_vec()
        }),
        Min => Some(if current.is_none() || le_u64(&existing) > le_u64(param) {
            param.to_vec()
        } else {
            existing
        }),
        SetVersionstampedKey | SetVersionstampedValue => Some(param.to_vec()),
        ByteMin => Some(if current.is_none() || existing.as_slice() > param {
            param.to_vec()
        } else {
            existing
        }),
        ByteMax => Some(if existing.as_slice() >= param {
            existing
        } else {
            param.to_vec()
        }),
        CompareAndClear => {
            if current.as_deref() == Some(param) {
                None
            } else {
                current
            }
        }
    }
}

fn bytewise(a: &[u8], b: &[u8], op: impl Fn(u8, u8) -> u8) -> Vec<u8> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| op(a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0)))
        .collect()
}
