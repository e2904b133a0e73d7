//! Adapters that re-issue the uniform client interface over a dynamically
//! loaded library's C ABI. The DL prefix stands for "dynamic library".

use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capi::{CApiTable, NativeCluster, NativeDatabase, NativeTransaction};
use crate::dynlib::DynLib;
use crate::error::{ClientError, ClientResult};
use crate::future::{
    extract_cluster, extract_database, extract_int64, extract_key, extract_key_array,
    extract_key_value_array, extract_string_array, extract_uint64, extract_unit, extract_value,
    DlFuture, Extract,
};
use crate::options::{
    ConflictRangeKind, DatabaseOption, MutationType, NetworkOption, TransactionOption,
};
use crate::traits::{
    ready_err, ClientApi, ClientDatabase, ClientTransaction, CompletionHook, KeySelector, KvFuture,
    RangeLimits, RangeResult,
};
use crate::version::{ProtocolVersion, DIRECT_DATABASE_API_VERSION, MAX_SUPPORTED_API_VERSION};

fn check(rc: c_int) -> ClientResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ClientError::from_code(rc))
    }
}

fn native_bool(value: bool) -> c_int {
    value as c_int
}

fn bridge<T: Send + 'static>(
    ptr: *mut crate::capi::NativeFuture,
    api: Arc<CApiTable>,
    extract: Extract<T>,
) -> KvFuture<T> {
    match DlFuture::from_ptr(ptr, api, extract) {
        Ok(future) => Box::pin(future),
        Err(err) => ready_err(err),
    }
}

/// Unique owner of a native database handle.
pub(crate) struct DatabaseHandle {
    ptr: NonNull<NativeDatabase>,
    api: Arc<CApiTable>,
}

unsafe impl Send for DatabaseHandle {}
unsafe impl Sync for DatabaseHandle {}

impl DatabaseHandle {
    pub(crate) fn new(ptr: *mut NativeDatabase, api: Arc<CApiTable>) -> ClientResult<DatabaseHandle> {
        NonNull::new(ptr)
            .map(|ptr| DatabaseHandle { ptr, api })
            .ok_or(ClientError::NullPointer)
    }

    fn as_ptr(&self) -> *mut NativeDatabase {
        self.ptr.as_ptr()
    }
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        unsafe {
            (self.api.database_destroy)(self.ptr.as_ptr());
        }
    }
}

/// Unique owner of a native transaction handle.
struct TransactionHandle {
    ptr: NonNull<NativeTransaction>,
    api: Arc<CApiTable>,
}

unsafe impl Send for TransactionHandle {}
unsafe impl Sync for TransactionHandle {}

impl TransactionHandle {
    fn new(ptr: *mut NativeTransaction, api: Arc<CApiTable>) -> ClientResult<TransactionHandle> {
        NonNull::new(ptr)
            .map(|ptr| TransactionHandle { ptr, api })
            .ok_or(ClientError::NullPointer)
    }

    fn as_ptr(&self) -> *mut NativeTransaction {
        self.ptr.as_ptr()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        unsafe {
            (self.api.transaction_destroy)(self.ptr.as_ptr());
        }
    }
}

/// Unique owner of a legacy cluster handle.
struct ClusterHandle {
    ptr: NonNull<NativeCluster>,
    api: Arc<CApiTable>,
}

unsafe impl Send for ClusterHandle {}

impl ClusterHandle {
    fn new(ptr: *mut NativeCluster, api: Arc<CApiTable>) -> ClientResult<ClusterHandle> {
        NonNull::new(ptr)
            .map(|ptr| ClusterHandle { ptr, api })
            .ok_or(ClientError::NullPointer)
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        if let Some(destroy) = self.api.cluster_destroy {
            unsafe { destroy(self.ptr.as_ptr()) }
        }
    }
}

type SharedDatabaseFuture = Shared<BoxFuture<'static, Result<Arc<DatabaseHandle>, ClientError>>>;

enum DatabaseSlot {
    Ready(Arc<DatabaseHandle>),
    /// Legacy cluster handshake still resolving the handle.
    Deferred(SharedDatabaseFuture),
}

/// A database created on an externally loaded client library.
pub struct DlDatabase {
    api: Arc<CApiTable>,
    slot: DatabaseSlot,
}

impl DlDatabase {
    fn ready(api: Arc<CApiTable>, handle: DatabaseHandle) -> DlDatabase {
        DlDatabase {
            api,
            slot: DatabaseSlot::Ready(Arc::new(handle)),
        }
    }

    fn deferred(api: Arc<CApiTable>, future: SharedDatabaseFuture) -> DlDatabase {
        DlDatabase {
            api,
            slot: DatabaseSlot::Deferred(future),
        }
    }

    /// The underlying handle; waits out the legacy handshake if it is still
    /// in flight.
    fn handle(&self) -> ClientResult<Arc<DatabaseHandle>> {
        match &self.slot {
            DatabaseSlot::Ready(handle) => Ok(handle.clone()),
            DatabaseSlot::Deferred(shared) => match shared.peek() {
                Some(result) => result.clone(),
                None => futures::executor::block_on(shared.clone()),
            },
        }
    }
}

impl ClientDatabase for DlDatabase {
    fn create_transaction(&self) -> ClientResult<Arc<dyn ClientTransaction>> {
        let handle = self.handle()?;
        let mut out: *mut NativeTransaction = ptr::null_mut();
        check(unsafe { (self.api.database_create_transaction)(handle.as_ptr(), &mut out) })?;
        Ok(Arc::new(DlTransaction {
            api: self.api.clone(),
            handle: TransactionHandle::new(out, self.api.clone())?,
        }))
    }

    fn set_option(&self, option: DatabaseOption, value: Option<&[u8]>) -> ClientResult<()> {
        let handle = self.handle()?;
        let (ptr, len) = raw_value(value);
        check(unsafe { (self.api.database_set_option)(handle.as_ptr(), option.code(), ptr, len) })
    }

    fn get_main_thread_busyness(&self) -> f64 {
        let Some(busyness) = self.api.database_get_main_thread_busyness else {
            return 0.0;
        };
        match self.handle() {
            Ok(handle) => unsafe { busyness(handle.as_ptr()) },
            Err(_) => 0.0,
        }
    }

    fn get_server_protocol(&self, expected: Option<ProtocolVersion>) -> KvFuture<ProtocolVersion> {
        let Some(get_protocol) = self.api.database_get_server_protocol else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return ready_err(err),
        };
        let ptr = unsafe { get_protocol(handle.as_ptr(), expected.map_or(0, |v| v.0)) };
        let future = match DlFuture::from_ptr(ptr, self.api.clone(), extract_uint64) {
            Ok(future) => future,
            Err(err) => return ready_err(err),
        };
        Box::pin(async move {
            let raw = future.await?;
            drop(handle);
            Ok(ProtocolVersion(raw))
        })
    }

    fn reboot_worker(&self, address: &[u8], check: bool, duration_secs: i32) -> KvFuture<i64> {
        let Some(reboot) = self.api.database_reboot_worker else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return ready_err(err),
        };
        let ptr = unsafe {
            reboot(
                handle.as_ptr(),
                address.as_ptr(),
                address.len() as c_int,
                native_bool(check),
                duration_secs,
            )
        };
        bridge(ptr, self.api.clone(), extract_int64)
    }

    fn force_recovery_with_data_loss(&self, dcid: &[u8]) -> KvFuture<()> {
        let Some(force) = self.api.database_force_recovery_with_data_loss else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return ready_err(err),
        };
        let ptr = unsafe { force(handle.as_ptr(), dcid.as_ptr(), dcid.len() as c_int) };
        bridge(ptr, self.api.clone(), extract_unit)
    }

    fn create_snapshot(&self, uid: &[u8], command: &[u8]) -> KvFuture<()> {
        let Some(snapshot) = self.api.database_create_snapshot else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return ready_err(err),
        };
        let ptr = unsafe {
            snapshot(
                handle.as_ptr(),
                uid.as_ptr(),
                uid.len() as c_int,
                command.as_ptr(),
                command.len() as c_int,
            )
        };
        bridge(ptr, self.api.clone(), extract_unit)
    }
}

fn raw_value(value: Option<&[u8]>) -> (*const u8, c_int) {
    match value {
        Some(bytes) => (bytes.as_ptr(), bytes.len() as c_int),
        None => (ptr::null(), 0),
    }
}

/// A transaction created on an externally loaded client library.
pub struct DlTransaction {
    api: Arc<CApiTable>,
    handle: TransactionHandle,
}

impl ClientTransaction for DlTransaction {
    fn set_read_version(&self, version: i64) {
        unsafe { (self.api.transaction_set_read_version)(self.handle.as_ptr(), version) }
    }

    fn get_read_version(&self) -> KvFuture<i64> {
        let ptr = unsafe { (self.api.transaction_get_read_version)(self.handle.as_ptr()) };
        bridge(ptr, self.api.clone(), extract_int64)
    }

    fn get(&self, key: &[u8], snapshot: bool) -> KvFuture<Option<Vec<u8>>> {
        let ptr = unsafe {
            (self.api.transaction_get)(
                self.handle.as_ptr(),
                key.as_ptr(),
                key.len() as c_int,
                native_bool(snapshot),
            )
        };
        bridge(ptr, self.api.clone(), extract_value)
    }

    fn get_key(&self, selector: &KeySelector, snapshot: bool) -> KvFuture<Vec<u8>> {
        let ptr = unsafe {
            (self.api.transaction_get_key)(
                self.handle.as_ptr(),
                selector.key.as_ptr(),
                selector.key.len() as c_int,
                native_bool(selector.or_equal),
                selector.offset,
                native_bool(snapshot),
            )
        };
        bridge(ptr, self.api.clone(), extract_key)
    }

    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> KvFuture<RangeResult> {
        let ptr = unsafe {
            (self.api.transaction_get_range)(
                self.handle.as_ptr(),
                begin.key.as_ptr(),
                begin.key.len() as c_int,
                native_bool(begin.or_equal),
                begin.offset,
                end.key.as_ptr(),
                end.key.len() as c_int,
                native_bool(end.or_equal),
                end.offset,
                limits.limit,
                limits.target_bytes,
                limits.mode.code(),
                limits.iteration,
                native_bool(snapshot),
                native_bool(reverse),
            )
        };
        bridge(ptr, self.api.clone(), extract_key_value_array)
    }

    fn get_addresses_for_key(&self, key: &[u8]) -> KvFuture<Vec<String>> {
        let ptr = unsafe {
            (self.api.transaction_get_addresses_for_key)(
                self.handle.as_ptr(),
                key.as_ptr(),
                key.len() as c_int,
            )
        };
        bridge(ptr, self.api.clone(), extract_string_array)
    }

    fn get_versionstamp(&self) -> KvFuture<Vec<u8>> {
        let Some(get_versionstamp) = self.api.transaction_get_versionstamp else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let ptr = unsafe { get_versionstamp(self.handle.as_ptr()) };
        bridge(ptr, self.api.clone(), extract_key)
    }

    fn get_estimated_range_size_bytes(&self, begin: &[u8], end: &[u8]) -> KvFuture<i64> {
        let Some(estimate) = self.api.transaction_get_estimated_range_size_bytes else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let ptr = unsafe {
            estimate(
                self.handle.as_ptr(),
                begin.as_ptr(),
                begin.len() as c_int,
                end.as_ptr(),
                end.len() as c_int,
            )
        };
        bridge(ptr, self.api.clone(), extract_int64)
    }

    fn get_range_split_points(
        &self,
        begin: &[u8],
        end: &[u8],
        chunk_size: i64,
    ) -> KvFuture<Vec<Vec<u8>>> {
        let Some(split_points) = self.api.transaction_get_range_split_points else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let ptr = unsafe {
            split_points(
                self.handle.as_ptr(),
                begin.as_ptr(),
                begin.len() as c_int,
                end.as_ptr(),
                end.len() as c_int,
                chunk_size,
            )
        };
        bridge(ptr, self.api.clone(), extract_key_array)
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        unsafe {
            (self.api.transaction_set)(
                self.handle.as_ptr(),
                key.as_ptr(),
                key.len() as c_int,
                value.as_ptr(),
                value.len() as c_int,
            )
        }
    }

    fn clear(&self, key: &[u8]) {
        unsafe {
            (self.api.transaction_clear)(self.handle.as_ptr(), key.as_ptr(), key.len() as c_int)
        }
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        unsafe {
            (self.api.transaction_clear_range)(
                self.handle.as_ptr(),
                begin.as_ptr(),
                begin.len() as c_int,
                end.as_ptr(),
                end.len() as c_int,
            )
        }
    }

    fn atomic_op(&self, key: &[u8], param: &[u8], operation: MutationType) {
        unsafe {
            (self.api.transaction_atomic_op)(
                self.handle.as_ptr(),
                key.as_ptr(),
                key.len() as c_int,
                param.as_ptr(),
                param.len() as c_int,
                operation.code(),
            )
        }
    }

    fn watch(&self, key: &[u8]) -> KvFuture<()> {
        let ptr = unsafe {
            (self.api.transaction_watch)(self.handle.as_ptr(), key.as_ptr(), key.len() as c_int)
        };
        bridge(ptr, self.api.clone(), extract_unit)
    }

    fn add_conflict_range(
        &self,
        begin: &[u8],
        end: &[u8],
        kind: ConflictRangeKind,
    ) -> ClientResult<()> {
        check(unsafe {
            (self.api.transaction_add_conflict_range)(
                self.handle.as_ptr(),
                begin.as_ptr(),
                begin.len() as c_int,
                end.as_ptr(),
                end.len() as c_int,
                kind.code(),
            )
        })
    }

    fn commit(&self) -> KvFuture<()> {
        let ptr = unsafe { (self.api.transaction_commit)(self.handle.as_ptr()) };
        bridge(ptr, self.api.clone(), extract_unit)
    }

    fn get_committed_version(&self) -> ClientResult<i64> {
        let mut version = 0i64;
        check(unsafe {
            (self.api.transaction_get_committed_version)(self.handle.as_ptr(), &mut version)
        })?;
        Ok(version)
    }

    fn get_approximate_size(&self) -> KvFuture<i64> {
        let Some(approximate_size) = self.api.transaction_get_approximate_size else {
            return ready_err(ClientError::UnsupportedOperation);
        };
        let ptr = unsafe { approximate_size(self.handle.as_ptr()) };
        bridge(ptr, self.api.clone(), extract_int64)
    }

    fn set_option(&self, option: TransactionOption, value: Option<&[u8]>) -> ClientResult<()> {
        let (ptr, len) = raw_value(value);
        check(unsafe {
            (self.api.transaction_set_option)(self.handle.as_ptr(), option.code(), ptr, len)
        })
    }

    fn on_error(&self, error: ClientError) -> KvFuture<()> {
        let ptr = unsafe { (self.api.transaction_on_error)(self.handle.as_ptr(), error.code()) };
        bridge(ptr, self.api.clone(), extract_unit)
    }

    fn reset(&self) {
        unsafe { (self.api.transaction_reset)(self.handle.as_ptr()) }
    }

    fn cancel(&self) {
        unsafe { (self.api.transaction_cancel)(self.handle.as_ptr()) }
    }
}

/// A client implementation loaded from an external shared library.
pub struct DlApi {
    path: PathBuf,
    api: Arc<CApiTable>,
    api_version: AtomicI32,
    network_setup: AtomicBool,
    hooks: Mutex<Vec<CompletionHook>>,
}

impl DlApi {
    /// Load and bind the library at `path`.
    pub fn load(path: &Path, unlink_after_load: bool) -> ClientResult<DlApi> {
        let lib = DynLib::open(path, unlink_after_load)?;
        let api = CApiTable::bind(lib)?;
        debug!(path = %path.display(), "bound client library symbol table");
        Ok(DlApi {
            path: path.to_path_buf(),
            api,
            api_version: AtomicI32::new(0),
            network_setup: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_database_direct(&self, cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>> {
        let path = CString::new(cluster_file)?;
        let mut out: *mut NativeDatabase = ptr::null_mut();
        check(unsafe { (self.api.create_database)(path.as_ptr(), &mut out) })?;
        Ok(Arc::new(DlDatabase::ready(
            self.api.clone(),
            DatabaseHandle::new(out, self.api.clone())?,
        )))
    }

    /// Database creation for clients predating the direct path: open a
    /// cluster handle, then ask it for a database. Both steps are futures,
    /// so the returned database resolves its handle lazily.
    fn create_database_legacy(&self, cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>> {
        let create_cluster = self
            .api
            .create_cluster
            .ok_or(ClientError::UnsupportedOperation)?;
        let cluster_create_database = self
            .api
            .cluster_create_database
            .ok_or(ClientError::UnsupportedOperation)?;

        let path = CString::new(cluster_file)?;
        let cluster_future = DlFuture::from_ptr(
            unsafe { create_cluster(path.as_ptr()) },
            self.api.clone(),
            extract_cluster,
        )?;

        let api = self.api.clone();
        let chain: BoxFuture<'static, Result<Arc<DatabaseHandle>, ClientError>> =
            Box::pin(async move {
                let cluster = ClusterHandle::new(cluster_future.await?.0, api.clone())?;
                const DB_NAME: &[u8] = b"DB";
                let database_future = DlFuture::from_ptr(
                    unsafe {
                        cluster_create_database(
                            cluster.ptr.as_ptr(),
                            DB_NAME.as_ptr(),
                            DB_NAME.len() as c_int,
                        )
                    },
                    api.clone(),
                    extract_database,
                )?;
                let raw = database_future.await?;
                Ok(Arc::new(DatabaseHandle::new(raw.0, api)?))
            });

        Ok(Arc::new(DlDatabase::deferred(
            self.api.clone(),
            chain.shared(),
        )))
    }
}

impl ClientApi for DlApi {
    fn select_api_version(&self, version: i32) -> ClientResult<()> {
        check(unsafe { (self.api.select_api_version)(version, MAX_SUPPORTED_API_VERSION) })?;
        self.api_version.store(version, Ordering::SeqCst);
        Ok(())
    }

    fn client_version(&self) -> String {
        let Some(get_client_version) = self.api.get_client_version else {
            return "unknown".to_string();
        };
        let raw = unsafe { get_client_version() };
        if raw.is_null() {
            return "unknown".to_string();
        }
        unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
    }

    fn set_network_option(&self, option: NetworkOption, value: Option<&[u8]>) -> ClientResult<()> {
        let (ptr, len) = raw_value(value);
        check(unsafe { (self.api.set_network_option)(option.code(), ptr, len) })
    }

    fn setup_network(&self) -> ClientResult<()> {
        check(unsafe { (self.api.setup_network)() })?;
        self.network_setup.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_network(&self) -> ClientResult<()> {
        let result = check(unsafe { (self.api.run_network)() });
        // The network thread is exiting; completion hooks run here, on it.
        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            hook();
        }
        result
    }

    fn stop_network(&self) -> ClientResult<()> {
        if !self.network_setup.load(Ordering::SeqCst) {
            return Ok(());
        }
        check(unsafe { (self.api.stop_network)() })
    }

    fn create_database(&self, cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>> {
        let api_version = self.api_version.load(Ordering::SeqCst);
        if api_version == 0 {
            return Err(ClientError::ApiVersionNotSet);
        }
        if api_version >= DIRECT_DATABASE_API_VERSION {
            self.create_database_direct(cluster_file)
        } else {
            warn!(path = %self.path.display(), api_version, "using legacy cluster handshake");
            self.create_database_legacy(cluster_file)
        }
    }

    fn add_network_thread_completion_hook(&self, hook: CompletionHook) -> ClientResult<()> {
        self.hooks.lock().push(hook);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::test_support::fake_table;
    use crate::capi::NativeTransaction;
    use std::sync::atomic::AtomicUsize;

    static TX_DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_transaction_destroy(_: *mut NativeTransaction) {
        TX_DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    fn transaction_with_fake_table(mutate: impl FnOnce(&mut CApiTable)) -> DlTransaction {
        let mut table = fake_table();
        table.transaction_destroy = counting_transaction_destroy;
        mutate(&mut table);
        let api = Arc::new(table);
        DlTransaction {
            api: api.clone(),
            handle: TransactionHandle::new(
                NonNull::<NativeTransaction>::dangling().as_ptr(),
                api,
            )
            .unwrap(),
        }
    }

    #[test]
    fn missing_optional_symbol_is_unsupported_operation() {
        let before = TX_DESTROYED.load(Ordering::SeqCst);
        {
            let transaction = transaction_with_fake_table(|_| {});
            let result = futures::executor::block_on(transaction.get_versionstamp());
            assert!(matches!(result, Err(ClientError::UnsupportedOperation)));
        }
        // The transaction handle is still destroyed exactly once.
        assert_eq!(TX_DESTROYED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn committed_version_uses_out_param() {
        let transaction = transaction_with_fake_table(|_| {});
        assert_eq!(transaction.get_committed_version().unwrap(), 0);
    }
}
