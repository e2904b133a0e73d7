//! The transaction proxy: application-visible transaction identity stays
//! stable while the backing client may be swapped underneath it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;

use crate::database::DatabaseState;
use crate::error::{ClientError, ClientResult};
use crate::options::{ConflictRangeKind, MutationType, TransactionOption, UniqueOrderedOptions};
use crate::traits::{
    ready_err, ready_ok, ClientDatabase, ClientTransaction, KeySelector, KvFuture, RangeLimits,
    RangeResult,
};

type OnChange = watch::Receiver<Option<Arc<dyn ClientDatabase>>>;

#[derive(Clone)]
struct TransactionInfo {
    /// `None` while no compatible client is bound; operations fail lazily
    /// with `ClusterVersionChanged` until a database appears.
    transaction: Option<Arc<dyn ClientTransaction>>,
    on_change: OnChange,
}

/// A transaction that transparently follows the parent database across
/// client swaps.
///
/// Options set through [`set_option`](ClientTransaction::set_option) are
/// sticky: they are recorded and replayed, in order, onto every inner
/// transaction created after a swap or reset.
pub struct MultiVersionTransaction {
    state: Arc<DatabaseState>,
    info: Mutex<TransactionInfo>,
    defaults: UniqueOrderedOptions<TransactionOption>,
    persistent_options: Mutex<Vec<(TransactionOption, Option<Vec<u8>>)>>,
    cancelled: AtomicBool,
}

impl MultiVersionTransaction {
    pub(crate) fn new(
        state: Arc<DatabaseState>,
        defaults: UniqueOrderedOptions<TransactionOption>,
    ) -> MultiVersionTransaction {
        let transaction = MultiVersionTransaction {
            info: Mutex::new(TransactionInfo {
                transaction: None,
                on_change: state.db_var.subscribe(),
            }),
            state,
            defaults,
            persistent_options: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        };
        *transaction.info.lock() = transaction.make_info();
        transaction
    }

    /// Build a fresh inner transaction from the current database, applying
    /// defaults first and then replaying the sticky options in order.
    fn make_info(&self) -> TransactionInfo {
        let mut on_change = self.state.db_var.subscribe();
        let db = on_change.borrow_and_update().clone();
        let transaction = db.and_then(|db| match db.create_transaction() {
            Ok(transaction) => {
                for (option, value) in self.defaults.iter() {
                    apply_option(&transaction, option, value);
                }
                for (option, value) in self.persistent_options.lock().iter() {
                    apply_option(&transaction, *option, value.as_deref());
                }
                Some(transaction)
            }
            Err(err) => {
                warn!(%err, "transaction creation failed on current database");
                None
            }
        });
        TransactionInfo {
            transaction,
            on_change,
        }
    }

    /// The cached inner transaction. A swap does not rebuild it; in-flight
    /// and later operations fail with `ClusterVersionChanged` until the
    /// caller's retry loop goes through `on_error` or `reset`. The one
    /// exception: a proxy that never had a database retries the binding as
    /// soon as one appears.
    fn get_info(&self) -> TransactionInfo {
        let mut guard = self.info.lock();
        if guard.transaction.is_none() && guard.on_change.has_changed().unwrap_or(false) {
            *guard = self.make_info();
        }
        guard.clone()
    }

    /// Run an async operation against the inner transaction, racing it
    /// against the swap signal: operations in flight when the database is
    /// replaced fail with `ClusterVersionChanged`.
    fn run<T, F>(&self, issue: F) -> KvFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<dyn ClientTransaction>) -> KvFuture<T>,
    {
        if self.cancelled.load(Ordering::SeqCst) {
            return ready_err(ClientError::TransactionCancelled);
        }
        let info = self.get_info();
        let Some(transaction) = info.transaction else {
            return ready_err(ClientError::ClusterVersionChanged);
        };
        let operation = issue(&transaction);
        let mut on_change = info.on_change;
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = on_change.changed() => Err(ClientError::ClusterVersionChanged),
                result = operation => result,
            }
        })
    }

    /// Run a synchronous call against the inner transaction, if one exists.
    /// Mutations issued while unbound are dropped; the eventual commit fails
    /// with `ClusterVersionChanged` anyway.
    fn with_current<R: Default>(&self, call: impl FnOnce(&Arc<dyn ClientTransaction>) -> R) -> R {
        if self.cancelled.load(Ordering::SeqCst) {
            return R::default();
        }
        match self.get_info().transaction {
            Some(transaction) => call(&transaction),
            None => R::default(),
        }
    }
}

fn apply_option(
    transaction: &Arc<dyn ClientTransaction>,
    option: TransactionOption,
    value: Option<&[u8]>,
) {
    match transaction.set_option(option, value) {
        Ok(()) | Err(ClientError::UnsupportedOption) => {}
        Err(err) => warn!(?option, %err, "sticky option replay failed"),
    }
}

impl ClientTransaction for MultiVersionTransaction {
    fn set_read_version(&self, version: i64) {
        self.with_current(|t| t.set_read_version(version));
    }

    fn get_read_version(&self) -> KvFuture<i64> {
        self.run(|t| t.get_read_version())
    }

    fn get(&self, key: &[u8], snapshot: bool) -> KvFuture<Option<Vec<u8>>> {
        self.run(|t| t.get(key, snapshot))
    }

    fn get_key(&self, selector: &KeySelector, snapshot: bool) -> KvFuture<Vec<u8>> {
        self.run(|t| t.get_key(selector, snapshot))
    }

    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> KvFuture<RangeResult> {
        self.run(|t| t.get_range(begin, end, limits, snapshot, reverse))
    }

    fn get_addresses_for_key(&self, key: &[u8]) -> KvFuture<Vec<String>> {
        self.run(|t| t.get_addresses_for_key(key))
    }

    fn get_versionstamp(&self) -> KvFuture<Vec<u8>> {
        self.run(|t| t.get_versionstamp())
    }

    fn get_estimated_range_size_bytes(&self, begin: &[u8], end: &[u8]) -> KvFuture<i64> {
        self.run(|t| t.get_estimated_range_size_bytes(begin, end))
    }

    fn get_range_split_points(
        &self,
        begin: &[u8],
        end: &[u8],
        chunk_size: i64,
    ) -> KvFuture<Vec<Vec<u8>>> {
        self.run(|t| t.get_range_split_points(begin, end, chunk_size))
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.with_current(|t| t.set(key, value));
    }

    fn clear(&self, key: &[u8]) {
        self.with_current(|t| t.clear(key));
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        self.with_current(|t| t.clear_range(begin, end));
    }

    fn atomic_op(&self, key: &[u8], param: &[u8], operation: MutationType) {
        self.with_current(|t| t.atomic_op(key, param, operation));
    }

    fn watch(&self, key: &[u8]) -> KvFuture<()> {
        self.run(|t| t.watch(key))
    }

    fn add_conflict_range(
        &self,
        begin: &[u8],
        end: &[u8],
        kind: ConflictRangeKind,
    ) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::TransactionCancelled);
        }
        match self.get_info().transaction {
            Some(transaction) => transaction.add_conflict_range(begin, end, kind),
            None => Err(ClientError::ClusterVersionChanged),
        }
    }

    fn commit(&self) -> KvFuture<()> {
        self.run(|t| t.commit())
    }

    fn get_committed_version(&self) -> ClientResult<i64> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::TransactionCancelled);
        }
        match self.get_info().transaction {
            Some(transaction) => transaction.get_committed_version(),
            None => Err(ClientError::ClusterVersionChanged),
        }
    }

    fn get_approximate_size(&self) -> KvFuture<i64> {
        self.run(|t| t.get_approximate_size())
    }

    /// Records the option as sticky and applies it to the current inner
    /// transaction.
    fn set_option(&self, option: TransactionOption, value: Option<&[u8]>) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::TransactionCancelled);
        }
        self.persistent_options
            .lock()
            .push((option, value.map(|v| v.to_vec())));
        match self.get_info().transaction {
            Some(transaction) => transaction.set_option(option, value),
            None => Ok(()),
        }
    }

    /// Delegate retry classification to the inner transaction. A swap error
    /// is handled here instead: the proxy rebinds to a fresh inner
    /// transaction and reports "retryable" so the caller's loop re-runs.
    fn on_error(&self, error: ClientError) -> KvFuture<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return ready_err(ClientError::TransactionCancelled);
        }
        if matches!(
            error,
            ClientError::ClusterVersionChanged | ClientError::TransactionCancelled
        ) {
            *self.info.lock() = self.make_info();
            return ready_ok(());
        }
        let info = self.get_info();
        let Some(transaction) = info.transaction else {
            *self.info.lock() = self.make_info();
            return ready_ok(());
        };
        let operation = transaction.on_error(error);
        let mut on_change = info.on_change;
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = on_change.changed() => Err(ClientError::TransactionCancelled),
                result = operation => result,
            }
        })
    }

    /// Swap in a fresh inner transaction; sticky options survive.
    fn reset(&self) {
        *self.info.lock() = self.make_info();
    }

    /// Terminal: no later operation on this proxy succeeds.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(transaction) = self.info.lock().transaction.as_ref() {
            transaction.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientInfo;
    use crate::database::MultiVersionDatabase;
    use crate::sim::{SimClient, SimCluster};
    use crate::traits::ClientApi;
    use crate::version::ProtocolVersion;
    use std::time::Duration;

    async fn bound_database(
        cluster: Arc<SimCluster>,
        clients: Vec<Arc<ClientInfo>>,
        monitor: Arc<SimClient>,
        version: ProtocolVersion,
    ) -> Arc<MultiVersionDatabase> {
        let monitor_db = monitor.create_database("probe.cluster").unwrap();
        let db = MultiVersionDatabase::new(
            clients,
            "c.cluster",
            Some(monitor_db),
            tokio::runtime::Handle::current(),
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while db.current_protocol_version() != Some(version) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("database never bound");
        let _ = cluster;
        db
    }

    #[tokio::test]
    async fn operations_fail_until_database_appears() {
        let cluster = SimCluster::new(ProtocolVersion::V6_3);
        let client = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
        let info = Arc::new(ClientInfo::local(client.clone()));
        let db = bound_database(cluster.clone(), vec![info], client, ProtocolVersion::V6_3).await;

        // Move the cluster somewhere the pool cannot follow.
        cluster.set_protocol_version(ProtocolVersion::V7_0);
        let transaction = db.create_transaction().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match transaction.get_read_version().await {
                    Err(ClientError::ClusterVersionChanged) => return,
                    _ => tokio::task::yield_now().await,
                }
            }
        })
        .await
        .expect("operations kept succeeding without a bound database");
    }

    #[tokio::test]
    async fn cancel_is_absorbing() {
        let cluster = SimCluster::new(ProtocolVersion::V6_3);
        let client = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
        let info = Arc::new(ClientInfo::local(client.clone()));
        let db = bound_database(cluster, vec![info], client, ProtocolVersion::V6_3).await;

        let transaction = db.create_transaction().unwrap();
        transaction.cancel();
        assert!(matches!(
            transaction.get_read_version().await,
            Err(ClientError::TransactionCancelled)
        ));
        assert!(matches!(
            transaction.set_option(TransactionOption::Timeout, Some(b"1000".as_slice())),
            Err(ClientError::TransactionCancelled)
        ));
        assert!(matches!(
            transaction.commit().await,
            Err(ClientError::TransactionCancelled)
        ));
    }
}
