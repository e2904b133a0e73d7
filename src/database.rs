//! The multi-version database: monitors the cluster's protocol version and
//! atomically swaps the backing client when it changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ClientInfo;
use crate::error::{ClientError, ClientResult};
use crate::options::{DatabaseOption, TransactionOption, UniqueOrderedOptions};
use crate::traits::{
    ready_err, ClientDatabase, ClientTransaction, KvFuture,
};
use crate::transaction::MultiVersionTransaction;
use crate::version::ProtocolVersion;

const MONITOR_BACKOFF_BASE: Duration = Duration::from_millis(100);
const MONITOR_BACKOFF_CAP: Duration = Duration::from_secs(5);

pub(crate) type DbVar = watch::Sender<Option<Arc<dyn ClientDatabase>>>;

/// A database whose backing client follows the cluster's protocol version.
///
/// Transactions created from it keep their application-visible identity
/// across swaps; see [`MultiVersionTransaction`].
pub struct MultiVersionDatabase {
    pub(crate) state: Arc<DatabaseState>,
}

impl MultiVersionDatabase {
    /// Assemble a database over an explicit candidate pool and start the
    /// protocol monitor. `version_monitor_db` is a connection made with the
    /// local client, used for probing until (and unless) the bound client
    /// can answer protocol queries itself.
    pub(crate) fn new(
        clients: Vec<Arc<ClientInfo>>,
        cluster_file: &str,
        version_monitor_db: Option<Arc<dyn ClientDatabase>>,
        runtime: Handle,
    ) -> Arc<MultiVersionDatabase> {
        let state = DatabaseState::new(cluster_file, version_monitor_db, runtime.clone());
        for client in clients {
            state.add_client(client);
        }
        let monitor = runtime.spawn(DatabaseState::monitor_protocol_version(state.clone()));
        *state.monitor_task.lock() = Some(monitor);
        Arc::new(MultiVersionDatabase { state })
    }

    /// Wrap an already-connected database, bypassing version monitoring.
    /// Used when the multi-version layer is disabled and in tests.
    pub fn from_existing(db: Arc<dyn ClientDatabase>) -> Arc<MultiVersionDatabase> {
        let state = DatabaseState::bound(db);
        Arc::new(MultiVersionDatabase { state })
    }

    /// The protocol version of the currently bound client, if any.
    pub fn current_protocol_version(&self) -> Option<ProtocolVersion> {
        self.state.inner.lock().db_protocol_version
    }

    /// Tear down monitors and release the active connection. Called
    /// automatically on drop.
    pub fn close(&self) {
        self.state.close();
    }
}

impl Drop for MultiVersionDatabase {
    fn drop(&mut self) {
        self.state.close();
    }
}

impl ClientDatabase for MultiVersionDatabase {
    fn create_transaction(&self) -> ClientResult<Arc<dyn ClientTransaction>> {
        let defaults = self.state.inner.lock().transaction_defaults.clone();
        Ok(Arc::new(MultiVersionTransaction::new(
            self.state.clone(),
            defaults,
        )))
    }

    fn set_option(&self, option: DatabaseOption, value: Option<&[u8]>) -> ClientResult<()> {
        let mut inner = self.state.inner.lock();
        if let Some(db) = inner.db.clone() {
            match db.set_option(option, value) {
                Ok(()) | Err(ClientError::UnsupportedOption) => {}
                Err(err) => return Err(err),
            }
        }
        if let Some(transaction_option) = option.transaction_default() {
            inner
                .transaction_defaults
                .set(transaction_option, value.map(|v| v.to_vec()));
        }
        inner.options.push((option, value.map(|v| v.to_vec())));
        Ok(())
    }

    fn get_main_thread_busyness(&self) -> f64 {
        match self.state.inner.lock().db.clone() {
            Some(db) => db.get_main_thread_busyness(),
            None => 0.0,
        }
    }

    fn get_server_protocol(&self, expected: Option<ProtocolVersion>) -> KvFuture<ProtocolVersion> {
        let monitor_db = {
            let inner = self.state.inner.lock();
            inner.version_monitor_db.clone().or_else(|| inner.db.clone())
        };
        match monitor_db {
            Some(db) => db.get_server_protocol(expected),
            None => ready_err(ClientError::ClusterVersionChanged),
        }
    }

    fn reboot_worker(&self, address: &[u8], check: bool, duration_secs: i32) -> KvFuture<i64> {
        match self.state.inner.lock().db.clone() {
            Some(db) => db.reboot_worker(address, check, duration_secs),
            None => ready_err(ClientError::ClusterVersionChanged),
        }
    }

    fn force_recovery_with_data_loss(&self, dcid: &[u8]) -> KvFuture<()> {
        match self.state.inner.lock().db.clone() {
            Some(db) => db.force_recovery_with_data_loss(dcid),
            None => ready_err(ClientError::ClusterVersionChanged),
        }
    }

    fn create_snapshot(&self, uid: &[u8], command: &[u8]) -> KvFuture<()> {
        match self.state.inner.lock().db.clone() {
            Some(db) => db.create_snapshot(uid, command),
            None => ready_err(ClientError::ClusterVersionChanged),
        }
    }
}

pub(crate) struct StateInner {
    /// The active database, if a compatible client is bound.
    pub(crate) db: Option<Arc<dyn ClientDatabase>>,
    /// Client backing `db`.
    active_client: Option<Arc<ClientInfo>>,
    /// Connection used for protocol probing. Same as `db` once the bound
    /// client can answer protocol queries.
    version_monitor_db: Option<Arc<dyn ClientDatabase>>,
    /// Local-client connection kept for probing while bound to a client
    /// that cannot report the protocol itself.
    probe_db: Option<Arc<dyn ClientDatabase>>,
    pub(crate) db_protocol_version: Option<ProtocolVersion>,
    /// Candidates keyed by normalized protocol version; at most one per key.
    clients: BTreeMap<ProtocolVersion, Arc<ClientInfo>>,
    /// Connections to pre-6.1 clusters are never closed; they are parked
    /// here and reused on rebind.
    legacy_connections: BTreeMap<ProtocolVersion, Arc<dyn ClientDatabase>>,
    legacy_monitors: Vec<Arc<LegacyVersionMonitor>>,
    legacy_monitors_started: bool,
    options: Vec<(DatabaseOption, Option<Vec<u8>>)>,
    pub(crate) transaction_defaults: UniqueOrderedOptions<TransactionOption>,
}

/// Connection state shared by the database facade, its transactions, and
/// the protocol monitor. All binding transitions run on the api's network
/// runtime; cross-thread callers only touch the option vectors (behind the
/// lock) and the `db_var` broadcast cell.
pub(crate) struct DatabaseState {
    pub(crate) cluster_file: String,
    pub(crate) db_var: DbVar,
    pub(crate) inner: Mutex<StateInner>,
    cancelled: AtomicBool,
    /// Wakes a parked protocol monitor after out-of-band state changes
    /// (legacy claim, client failure).
    probe_wake: Notify,
    runtime: Option<Handle>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseState {
    fn new(
        cluster_file: &str,
        version_monitor_db: Option<Arc<dyn ClientDatabase>>,
        runtime: Handle,
    ) -> Arc<DatabaseState> {
        let (db_var, _) = watch::channel(None);
        Arc::new(DatabaseState {
            cluster_file: cluster_file.to_string(),
            db_var,
            inner: Mutex::new(StateInner {
                db: None,
                active_client: None,
                version_monitor_db: version_monitor_db.clone(),
                probe_db: version_monitor_db,
                db_protocol_version: None,
                clients: BTreeMap::new(),
                legacy_connections: BTreeMap::new(),
                legacy_monitors: Vec::new(),
                legacy_monitors_started: false,
                options: Vec::new(),
                transaction_defaults: UniqueOrderedOptions::new(),
            }),
            cancelled: AtomicBool::new(false),
            probe_wake: Notify::new(),
            runtime: Some(runtime),
            monitor_task: Mutex::new(None),
        })
    }

    /// State for an already-bound database with no monitoring.
    fn bound(db: Arc<dyn ClientDatabase>) -> Arc<DatabaseState> {
        let (db_var, _) = watch::channel(Some(db.clone()));
        Arc::new(DatabaseState {
            cluster_file: String::new(),
            db_var,
            inner: Mutex::new(StateInner {
                db: Some(db.clone()),
                active_client: None,
                version_monitor_db: Some(db),
                probe_db: None,
                db_protocol_version: None,
                clients: BTreeMap::new(),
                legacy_connections: BTreeMap::new(),
                legacy_monitors: Vec::new(),
                legacy_monitors_started: true,
                options: Vec::new(),
                transaction_defaults: UniqueOrderedOptions::new(),
            }),
            cancelled: AtomicBool::new(false),
            probe_wake: Notify::new(),
            runtime: None,
            monitor_task: Mutex::new(None),
        })
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Register a candidate client. At most one client is kept per
    /// normalized protocol version; the first registered wins unless a
    /// newcomer may replace it.
    fn add_client(&self, client: Arc<ClientInfo>) {
        let version = match client.load_protocol_version() {
            Ok(version) => version,
            Err(err) => {
                warn!(path = %client.desc().lib_path.display(), %err,
                    "client version probe failed");
                client.mark_failed();
                return;
            }
        };
        let mut inner = self.inner.lock();
        match inner.clients.entry(version.normalized()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(client);
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if client.can_replace(entry.get()) {
                    debug!(protocol = %version, "replacing candidate client");
                    entry.insert(client);
                } else {
                    warn!(
                        path = %client.desc().lib_path.display(),
                        protocol = %version,
                        "ignoring duplicate client for protocol version"
                    );
                }
            }
        }
    }

    /// Watch the cluster protocol version and rebind on changes.
    async fn monitor_protocol_version(state: Arc<DatabaseState>) {
        let mut backoff = MONITOR_BACKOFF_BASE;
        loop {
            if state.cancelled() {
                return;
            }
            let (monitor_db, expected) = {
                let inner = state.inner.lock();
                (inner.version_monitor_db.clone(), inner.db_protocol_version)
            };
            let Some(monitor_db) = monitor_db else {
                state.start_legacy_version_monitors();
                state.probe_wake.notified().await;
                continue;
            };

            tokio::select! {
                result = monitor_db.get_server_protocol(expected) => match result {
                    Ok(version) => {
                        backoff = MONITOR_BACKOFF_BASE;
                        state.protocol_version_changed(version);
                    }
                    Err(ClientError::UnsupportedOperation) => {
                        debug!("monitor connection cannot report protocol; starting legacy probes");
                        state.start_legacy_version_monitors();
                        state.probe_wake.notified().await;
                    }
                    Err(err) => {
                        debug!(%err, "protocol version probe failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MONITOR_BACKOFF_CAP);
                    }
                },
                _ = state.probe_wake.notified() => {}
            }
        }
    }

    /// React to an observed protocol version. Runs on the network runtime,
    /// from either the protocol monitor or a legacy GRV probe.
    pub(crate) fn protocol_version_changed(&self, version: ProtocolVersion) {
        if self.cancelled() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.db_protocol_version == Some(version) {
            return;
        }
        info!(protocol = %version, cluster_file = %self.cluster_file, "cluster protocol observed");

        let candidate = inner
            .clients
            .get(&version.normalized())
            .filter(|client| !client.failed())
            .cloned();

        let Some(client) = candidate else {
            warn!(protocol = %version, "no loaded client speaks this protocol");
            // Remember the version so the monitor waits for a different one,
            // and drop the stale binding.
            inner.db_protocol_version = Some(version);
            self.clear_active(&mut inner);
            self.db_var.send_replace(None);
            return;
        };

        let new_db = match inner.legacy_connections.get(&version) {
            Some(db) => Ok(db.clone()),
            None => client.api.create_database(&self.cluster_file),
        };
        match new_db {
            Ok(db) => {
                inner.db_protocol_version = Some(version);
                self.update_database(&mut inner, db, client, version);
            }
            Err(err) => {
                error!(path = %client.desc().lib_path.display(), %err,
                    "database creation failed; dropping client");
                client.mark_failed();
                inner.db_protocol_version = None;
                self.clear_active(&mut inner);
                self.db_var.send_replace(None);
                self.probe_wake.notify_one();
            }
        }
    }

    /// Install `new_db` as the active database: replay recorded options,
    /// park legacy connections instead of closing them, repoint the version
    /// monitor, and publish the swap.
    fn update_database(
        &self,
        inner: &mut StateInner,
        new_db: Arc<dyn ClientDatabase>,
        client: Arc<ClientInfo>,
        version: ProtocolVersion,
    ) {
        let options = inner.options.clone();
        for (option, value) in &options {
            match new_db.set_option(*option, value.as_deref()) {
                Ok(()) | Err(ClientError::UnsupportedOption) => {}
                Err(err) => {
                    error!(path = %client.desc().lib_path.display(), %err,
                        "option replay failed on new database; dropping client");
                    client.mark_failed();
                    inner.db_protocol_version = None;
                    self.clear_active(inner);
                    self.db_var.send_replace(None);
                    self.probe_wake.notify_one();
                    return;
                }
            }
        }

        if let (Some(old_db), Some(old_version)) = (inner.db.take(), inner.active_client.as_ref().and_then(|c| c.protocol_version())) {
            if !old_version.benefits_from_close() {
                inner.legacy_connections.insert(old_version, old_db);
            }
        }
        if !version.benefits_from_close() {
            inner.legacy_connections.insert(version, new_db.clone());
        }

        inner.db = Some(new_db.clone());
        inner.active_client = Some(client.clone());
        inner.version_monitor_db = if version.supports_protocol_query() {
            Some(new_db.clone())
        } else {
            inner.probe_db.clone()
        };

        info!(
            path = %client.desc().lib_path.display(),
            protocol = %version,
            "bound database to client"
        );
        self.db_var.send_replace(Some(new_db));
        self.probe_wake.notify_one();
    }

    pub(crate) fn active_client(&self) -> Option<Arc<ClientInfo>> {
        self.inner.lock().active_client.clone()
    }

    fn clear_active(&self, inner: &mut StateInner) {
        if let (Some(old_db), Some(old_version)) = (
            inner.db.take(),
            inner.active_client.as_ref().and_then(|c| c.protocol_version()),
        ) {
            if !old_version.benefits_from_close() {
                inner.legacy_connections.insert(old_version, old_db);
            }
        }
        inner.active_client = None;
        inner.version_monitor_db = inner.probe_db.clone();
    }

    /// Start a GRV-probe monitor per legacy client that cannot announce its
    /// protocol over the connect packet. Idempotent.
    fn start_legacy_version_monitors(self: &Arc<Self>) {
        let Some(runtime) = self.runtime.clone() else {
            return;
        };
        let monitors: Vec<Arc<LegacyVersionMonitor>> = {
            let mut inner = self.inner.lock();
            if inner.legacy_monitors_started {
                return;
            }
            inner.legacy_monitors_started = true;
            let monitors: Vec<_> = inner
                .clients
                .values()
                .filter(|client| {
                    !client.failed()
                        && client
                            .protocol_version()
                            .is_some_and(|v| !v.supports_protocol_query())
                })
                .map(|client| LegacyVersionMonitor::new(client.clone(), Arc::downgrade(self)))
                .collect();
            inner.legacy_monitors = monitors.clone();
            monitors
        };
        for monitor in monitors {
            debug!(path = %monitor.client.desc().lib_path.display(), "starting legacy version monitor");
            let task = runtime.spawn(LegacyVersionMonitor::run(monitor.clone()));
            *monitor.task.lock() = Some(task);
        }
    }

    /// Terminal: cancel monitors, break the monitor/state reference cycle,
    /// and release the active connection (legacy connections stay parked).
    pub(crate) fn close(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.monitor_task.lock().take() {
            task.abort();
        }
        let monitors = {
            let mut inner = self.inner.lock();
            inner.db = None;
            inner.active_client = None;
            inner.version_monitor_db = None;
            inner.probe_db = None;
            std::mem::take(&mut inner.legacy_monitors)
        };
        for monitor in monitors {
            monitor.close();
        }
        self.db_var.send_replace(None);
        self.probe_wake.notify_one();
    }
}

/// Determines the cluster version for clients too old to announce their
/// protocol: build a connection with that client and probe it with a
/// read-version request. Success means the cluster speaks the client's
/// protocol.
pub(crate) struct LegacyVersionMonitor {
    client: Arc<ClientInfo>,
    // Weak on purpose: the state owns the monitor, not the other way round.
    state: Weak<DatabaseState>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LegacyVersionMonitor {
    fn new(client: Arc<ClientInfo>, state: Weak<DatabaseState>) -> Arc<LegacyVersionMonitor> {
        Arc::new(LegacyVersionMonitor {
            client,
            state,
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    async fn run(self: Arc<Self>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let db = match self.client.api.create_database(&state.cluster_file) {
            Ok(db) => db,
            Err(err) => {
                warn!(path = %self.client.desc().lib_path.display(), %err,
                    "legacy monitor could not open probe connection");
                self.client.mark_failed();
                return;
            }
        };
        drop(state);

        let mut backoff = MONITOR_BACKOFF_BASE;
        loop {
            let Some(state) = self.state.upgrade() else {
                return;
            };
            if self.closed.load(Ordering::SeqCst) || state.cancelled() {
                return;
            }

            let probe: ClientResult<()> = async {
                let transaction = db.create_transaction()?;
                transaction.get_read_version().await.map(|_| ())
            }
            .await;

            match probe {
                Ok(()) => {
                    backoff = MONITOR_BACKOFF_BASE;
                    let version = self
                        .client
                        .protocol_version()
                        .expect("legacy client has a probed protocol version");
                    debug!(path = %self.client.desc().lib_path.display(), protocol = %version,
                        "legacy GRV probe succeeded");
                    state.protocol_version_changed(version);

                    // Stay quiet while our client is the active one; resume
                    // probing once the binding moves elsewhere.
                    let mut db_rx = state.db_var.subscribe();
                    drop(state);
                    loop {
                        if self.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        let still_active = self
                            .state
                            .upgrade()
                            .and_then(|s| s.active_client())
                            .is_some_and(|active| Arc::ptr_eq(&active, &self.client));
                        if !still_active {
                            break;
                        }
                        if db_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!(path = %self.client.desc().lib_path.display(), %err,
                        "legacy GRV probe failed");
                    drop(state);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MONITOR_BACKOFF_CAP);
                }
            }
        }
    }

    /// Stop the monitor and drop its probe connection. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClient, SimCluster};
    use crate::traits::ClientApi;

    fn wait_for_protocol(
        db: &MultiVersionDatabase,
        version: ProtocolVersion,
    ) -> impl std::future::Future<Output = ()> + '_ {
        async move {
            tokio::time::timeout(Duration::from_secs(5), async {
                let mut rx = db.state.db_var.subscribe();
                loop {
                    if db.current_protocol_version() == Some(version) {
                        return;
                    }
                    let _ = rx.changed().await;
                }
            })
            .await
            .expect("timed out waiting for protocol bind");
        }
    }

    #[tokio::test]
    async fn binds_to_matching_client() {
        let cluster = SimCluster::new(ProtocolVersion::V6_3);
        let client = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
        let info = Arc::new(ClientInfo::local(client.clone()));
        let monitor_db = client.create_database("probe.cluster").unwrap();

        let db = MultiVersionDatabase::new(
            vec![info],
            "c.cluster",
            Some(monitor_db),
            Handle::current(),
        );
        wait_for_protocol(&db, ProtocolVersion::V6_3).await;
        assert!(db.state.inner.lock().db.is_some());
    }

    #[tokio::test]
    async fn rebinds_when_cluster_upgrades() {
        let cluster = SimCluster::new(ProtocolVersion::V6_2);
        let old = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
        let new = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
        let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
        let monitor_db = local.create_database("probe.cluster").unwrap();

        let db = MultiVersionDatabase::new(
            vec![
                Arc::new(ClientInfo::external(old, "libold.so".into(), 0)),
                Arc::new(ClientInfo::external(new, "libnew.so".into(), 0)),
            ],
            "c.cluster",
            Some(monitor_db),
            Handle::current(),
        );
        wait_for_protocol(&db, ProtocolVersion::V6_2).await;

        cluster.set_protocol_version(ProtocolVersion::V6_3);
        wait_for_protocol(&db, ProtocolVersion::V6_3).await;
    }

    #[tokio::test]
    async fn unmatched_protocol_clears_binding() {
        let cluster = SimCluster::new(ProtocolVersion::V6_2);
        let only = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
        let monitor_db = only.create_database("probe.cluster").unwrap();

        let db = MultiVersionDatabase::new(
            vec![Arc::new(ClientInfo::external(only, "libv62.so".into(), 0))],
            "c.cluster",
            Some(monitor_db),
            Handle::current(),
        );
        wait_for_protocol(&db, ProtocolVersion::V6_2).await;

        // Upgrade to a version nothing in the pool speaks.
        cluster.set_protocol_version(ProtocolVersion::V7_0);
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut rx = db.state.db_var.subscribe();
            while db.state.inner.lock().db.is_some() {
                let _ = rx.changed().await;
            }
        })
        .await
        .expect("binding never cleared");
    }

    #[tokio::test]
    async fn legacy_client_binds_through_grv_probe() {
        let cluster = SimCluster::new(ProtocolVersion::V5_0);
        // The local client cannot see legacy clusters through the connect
        // packet, so the state machine has to fall back to GRV probing.
        let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3)
            .without_protocol_query()
            .build();
        let legacy = SimClient::builder(cluster.clone(), ProtocolVersion::V5_0)
            .without_protocol_query()
            .build();
        let monitor_db = local.create_database("probe.cluster").unwrap();

        let db = MultiVersionDatabase::new(
            vec![Arc::new(ClientInfo::external(legacy, "libv50.so".into(), 0))],
            "c.cluster",
            Some(monitor_db),
            Handle::current(),
        );
        wait_for_protocol(&db, ProtocolVersion::V5_0).await;

        // Pre-6.1 connections are retained rather than closed.
        assert!(db
            .state
            .inner
            .lock()
            .legacy_connections
            .contains_key(&ProtocolVersion::V5_0));
        db.close();
    }
}
