//! The C ABI exported by every loadable client library.
//!
//! Client releases export a fixed `strata_*` symbol set; [`CApiTable`] binds
//! the whole set up front so a missing required entry point fails the load
//! instead of a call site. Optional entries model capabilities that newer
//! releases added; a `None` there surfaces as
//! [`UnsupportedOperation`](crate::error::ClientError::UnsupportedOperation).

use std::os::raw::{c_char, c_double, c_int, c_void};
use std::sync::Arc;

use crate::dynlib::DynLib;
use crate::error::ClientResult;

/// Opaque native handle types. Only ever touched through pointers.
#[repr(C)]
pub struct NativeFuture {
    _private: [u8; 0],
}
#[repr(C)]
pub struct NativeCluster {
    _private: [u8; 0],
}
#[repr(C)]
pub struct NativeDatabase {
    _private: [u8; 0],
}
#[repr(C)]
pub struct NativeTransaction {
    _private: [u8; 0],
}

/// Nonzero values are client error codes; see [`crate::error::codes`].
pub type NativeError = c_int;

/// C-side boolean.
pub type NativeBool = c_int;

/// Borrowed key as returned inside future results.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeKey {
    pub key: *const u8,
    pub key_length: c_int,
}

/// Borrowed key-value pair as returned inside range results.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeKeyValue {
    pub key: *const u8,
    pub key_length: c_int,
    pub value: *const u8,
    pub value_length: c_int,
}

/// One-shot completion callback registered on a native future.
///
/// ABI contract: at most one callback may be registered per future, and a
/// registered callback is invoked exactly once, on an arbitrary internal
/// thread of the client library. Cancelling the future still invokes the
/// callback (the future then reports `OPERATION_CANCELLED`).
pub type FutureCallback = unsafe extern "C" fn(future: *mut NativeFuture, user_data: *mut c_void);

// Network lifecycle.
pub type SelectApiVersionFn =
    unsafe extern "C" fn(runtime_version: c_int, header_version: c_int) -> NativeError;
pub type GetClientVersionFn = unsafe extern "C" fn() -> *const c_char;
pub type SetNetworkOptionFn =
    unsafe extern "C" fn(option: c_int, value: *const u8, value_length: c_int) -> NativeError;
pub type SetupNetworkFn = unsafe extern "C" fn() -> NativeError;
pub type RunNetworkFn = unsafe extern "C" fn() -> NativeError;
pub type StopNetworkFn = unsafe extern "C" fn() -> NativeError;
pub type CreateDatabaseFn = unsafe extern "C" fn(
    cluster_file_path: *const c_char,
    out_database: *mut *mut NativeDatabase,
) -> NativeError;

// Database operations.
pub type DatabaseCreateTransactionFn = unsafe extern "C" fn(
    database: *mut NativeDatabase,
    out_transaction: *mut *mut NativeTransaction,
) -> NativeError;
pub type DatabaseSetOptionFn = unsafe extern "C" fn(
    database: *mut NativeDatabase,
    option: c_int,
    value: *const u8,
    value_length: c_int,
) -> NativeError;
pub type DatabaseDestroyFn = unsafe extern "C" fn(database: *mut NativeDatabase);
pub type DatabaseRebootWorkerFn = unsafe extern "C" fn(
    database: *mut NativeDatabase,
    address: *const u8,
    address_length: c_int,
    check: NativeBool,
    duration: c_int,
) -> *mut NativeFuture;
pub type DatabaseForceRecoveryFn = unsafe extern "C" fn(
    database: *mut NativeDatabase,
    dcid: *const u8,
    dcid_length: c_int,
) -> *mut NativeFuture;
pub type DatabaseCreateSnapshotFn = unsafe extern "C" fn(
    database: *mut NativeDatabase,
    uid: *const u8,
    uid_length: c_int,
    command: *const u8,
    command_length: c_int,
) -> *mut NativeFuture;
pub type DatabaseMainThreadBusynessFn =
    unsafe extern "C" fn(database: *mut NativeDatabase) -> c_double;
pub type DatabaseGetServerProtocolFn =
    unsafe extern "C" fn(database: *mut NativeDatabase, expected_version: u64) -> *mut NativeFuture;

// Transaction operations.
pub type TransactionSetOptionFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    option: c_int,
    value: *const u8,
    value_length: c_int,
) -> NativeError;
pub type TransactionDestroyFn = unsafe extern "C" fn(transaction: *mut NativeTransaction);
pub type TransactionSetReadVersionFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction, version: i64);
pub type TransactionGetReadVersionFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction) -> *mut NativeFuture;
pub type TransactionGetFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
    snapshot: NativeBool,
) -> *mut NativeFuture;
pub type TransactionGetKeyFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
    or_equal: NativeBool,
    offset: c_int,
    snapshot: NativeBool,
) -> *mut NativeFuture;
pub type TransactionGetAddressesForKeyFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
) -> *mut NativeFuture;
#[allow(clippy::too_many_arguments)]
pub type TransactionGetRangeFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    begin_key: *const u8,
    begin_key_length: c_int,
    begin_or_equal: NativeBool,
    begin_offset: c_int,
    end_key: *const u8,
    end_key_length: c_int,
    end_or_equal: NativeBool,
    end_offset: c_int,
    limit: c_int,
    target_bytes: c_int,
    mode: c_int,
    iteration: c_int,
    snapshot: NativeBool,
    reverse: NativeBool,
) -> *mut NativeFuture;
pub type TransactionGetVersionstampFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction) -> *mut NativeFuture;
pub type TransactionSetFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
    value: *const u8,
    value_length: c_int,
);
pub type TransactionClearFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction, key: *const u8, key_length: c_int);
pub type TransactionClearRangeFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    begin_key: *const u8,
    begin_key_length: c_int,
    end_key: *const u8,
    end_key_length: c_int,
);
pub type TransactionAtomicOpFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
    param: *const u8,
    param_length: c_int,
    operation_type: c_int,
);
pub type TransactionGetEstimatedRangeSizeFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    begin_key: *const u8,
    begin_key_length: c_int,
    end_key: *const u8,
    end_key_length: c_int,
) -> *mut NativeFuture;
pub type TransactionGetRangeSplitPointsFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    begin_key: *const u8,
    begin_key_length: c_int,
    end_key: *const u8,
    end_key_length: c_int,
    chunk_size: i64,
) -> *mut NativeFuture;
pub type TransactionCommitFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction) -> *mut NativeFuture;
pub type TransactionGetCommittedVersionFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    out_version: *mut i64,
) -> NativeError;
pub type TransactionGetApproximateSizeFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction) -> *mut NativeFuture;
pub type TransactionWatchFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    key: *const u8,
    key_length: c_int,
) -> *mut NativeFuture;
pub type TransactionOnErrorFn =
    unsafe extern "C" fn(transaction: *mut NativeTransaction, error: NativeError) -> *mut NativeFuture;
pub type TransactionResetFn = unsafe extern "C" fn(transaction: *mut NativeTransaction);
pub type TransactionCancelFn = unsafe extern "C" fn(transaction: *mut NativeTransaction);
pub type TransactionAddConflictRangeFn = unsafe extern "C" fn(
    transaction: *mut NativeTransaction,
    begin_key: *const u8,
    begin_key_length: c_int,
    end_key: *const u8,
    end_key_length: c_int,
    kind: c_int,
) -> NativeError;

// Future extraction.
pub type FutureGetDatabaseFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_database: *mut *mut NativeDatabase,
) -> NativeError;
pub type FutureGetInt64Fn =
    unsafe extern "C" fn(future: *mut NativeFuture, out_value: *mut i64) -> NativeError;
pub type FutureGetUInt64Fn =
    unsafe extern "C" fn(future: *mut NativeFuture, out_value: *mut u64) -> NativeError;
pub type FutureGetBoolFn =
    unsafe extern "C" fn(future: *mut NativeFuture, out_value: *mut NativeBool) -> NativeError;
pub type FutureGetErrorFn = unsafe extern "C" fn(future: *mut NativeFuture) -> NativeError;
pub type FutureGetKeyFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_key: *mut *const u8,
    out_key_length: *mut c_int,
) -> NativeError;
pub type FutureGetValueFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_present: *mut NativeBool,
    out_value: *mut *const u8,
    out_value_length: *mut c_int,
) -> NativeError;
pub type FutureGetStringArrayFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_strings: *mut *const *const c_char,
    out_count: *mut c_int,
) -> NativeError;
pub type FutureGetKeyArrayFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_keys: *mut *const NativeKey,
    out_count: *mut c_int,
) -> NativeError;
pub type FutureGetKeyValueArrayFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_kv: *mut *const NativeKeyValue,
    out_count: *mut c_int,
    out_more: *mut NativeBool,
) -> NativeError;
pub type FutureSetCallbackFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    callback: FutureCallback,
    user_data: *mut c_void,
) -> NativeError;
pub type FutureCancelFn = unsafe extern "C" fn(future: *mut NativeFuture);
pub type FutureDestroyFn = unsafe extern "C" fn(future: *mut NativeFuture);

// Legacy cluster handshake (releases before the direct createDatabase path).
pub type CreateClusterFn =
    unsafe extern "C" fn(cluster_file_path: *const c_char) -> *mut NativeFuture;
pub type ClusterCreateDatabaseFn = unsafe extern "C" fn(
    cluster: *mut NativeCluster,
    db_name: *const u8,
    db_name_length: c_int,
) -> *mut NativeFuture;
pub type ClusterDestroyFn = unsafe extern "C" fn(cluster: *mut NativeCluster);
pub type FutureGetClusterFn = unsafe extern "C" fn(
    future: *mut NativeFuture,
    out_cluster: *mut *mut NativeCluster,
) -> NativeError;

/// Function-pointer table bound from one loaded client library.
///
/// Immutable after [`CApiTable::bind`]; shared by reference between every
/// adapter created for the library. Holding the table keeps the library
/// mapped.
pub struct CApiTable {
    // Keeps the shared object alive for as long as any function pointer may
    // be called. `None` only for tables assembled in tests.
    _lib: Option<DynLib>,

    pub(crate) select_api_version: SelectApiVersionFn,
    pub(crate) get_client_version: Option<GetClientVersionFn>,
    pub(crate) set_network_option: SetNetworkOptionFn,
    pub(crate) setup_network: SetupNetworkFn,
    pub(crate) run_network: RunNetworkFn,
    pub(crate) stop_network: StopNetworkFn,
    pub(crate) create_database: CreateDatabaseFn,

    pub(crate) database_create_transaction: DatabaseCreateTransactionFn,
    pub(crate) database_set_option: DatabaseSetOptionFn,
    pub(crate) database_destroy: DatabaseDestroyFn,
    pub(crate) database_reboot_worker: Option<DatabaseRebootWorkerFn>,
    pub(crate) database_force_recovery_with_data_loss: Option<DatabaseForceRecoveryFn>,
    pub(crate) database_create_snapshot: Option<DatabaseCreateSnapshotFn>,
    pub(crate) database_get_main_thread_busyness: Option<DatabaseMainThreadBusynessFn>,
    pub(crate) database_get_server_protocol: Option<DatabaseGetServerProtocolFn>,

    pub(crate) transaction_set_option: TransactionSetOptionFn,
    pub(crate) transaction_destroy: TransactionDestroyFn,
    pub(crate) transaction_set_read_version: TransactionSetReadVersionFn,
    pub(crate) transaction_get_read_version: TransactionGetReadVersionFn,
    pub(crate) transaction_get: TransactionGetFn,
    pub(crate) transaction_get_key: TransactionGetKeyFn,
    pub(crate) transaction_get_addresses_for_key: TransactionGetAddressesForKeyFn,
    pub(crate) transaction_get_range: TransactionGetRangeFn,
    pub(crate) transaction_get_versionstamp: Option<TransactionGetVersionstampFn>,
    pub(crate) transaction_set: TransactionSetFn,
    pub(crate) transaction_clear: TransactionClearFn,
    pub(crate) transaction_clear_range: TransactionClearRangeFn,
    pub(crate) transaction_atomic_op: TransactionAtomicOpFn,
    pub(crate) transaction_get_estimated_range_size_bytes:
        Option<TransactionGetEstimatedRangeSizeFn>,
    pub(crate) transaction_get_range_split_points: Option<TransactionGetRangeSplitPointsFn>,
    pub(crate) transaction_commit: TransactionCommitFn,
    pub(crate) transaction_get_committed_version: TransactionGetCommittedVersionFn,
    pub(crate) transaction_get_approximate_size: Option<TransactionGetApproximateSizeFn>,
    pub(crate) transaction_watch: TransactionWatchFn,
    pub(crate) transaction_on_error: TransactionOnErrorFn,
    pub(crate) transaction_reset: TransactionResetFn,
    pub(crate) transaction_cancel: TransactionCancelFn,
    pub(crate) transaction_add_conflict_range: TransactionAddConflictRangeFn,

    pub(crate) future_get_database: FutureGetDatabaseFn,
    pub(crate) future_get_int64: FutureGetInt64Fn,
    pub(crate) future_get_uint64: FutureGetUInt64Fn,
    pub(crate) future_get_bool: FutureGetBoolFn,
    pub(crate) future_get_error: FutureGetErrorFn,
    pub(crate) future_get_key: FutureGetKeyFn,
    pub(crate) future_get_value: FutureGetValueFn,
    pub(crate) future_get_string_array: FutureGetStringArrayFn,
    pub(crate) future_get_key_array: FutureGetKeyArrayFn,
    pub(crate) future_get_key_value_array: FutureGetKeyValueArrayFn,
    pub(crate) future_set_callback: FutureSetCallbackFn,
    pub(crate) future_cancel: FutureCancelFn,
    pub(crate) future_destroy: FutureDestroyFn,

    pub(crate) create_cluster: Option<CreateClusterFn>,
    pub(crate) cluster_create_database: Option<ClusterCreateDatabaseFn>,
    pub(crate) cluster_destroy: Option<ClusterDestroyFn>,
    pub(crate) future_get_cluster: Option<FutureGetClusterFn>,
}

impl CApiTable {
    /// Bind the full symbol set from a loaded library.
    pub fn bind(lib: DynLib) -> ClientResult<Arc<CApiTable>> {
        // Safety: each symbol name is paired with the function-pointer type
        // the ABI defines for it, and the table keeps `lib` alive.
        unsafe {
            Ok(Arc::new(CApiTable {
                select_api_version: lib.required("strata_select_api_version")?,
                get_client_version: lib.optional("strata_get_client_version"),
                set_network_option: lib.required("strata_network_set_option")?,
                setup_network: lib.required("strata_setup_network")?,
                run_network: lib.required("strata_run_network")?,
                stop_network: lib.required("strata_stop_network")?,
                create_database: lib.required("strata_create_database")?,

                database_create_transaction: lib.required("strata_database_create_transaction")?,
                database_set_option: lib.required("strata_database_set_option")?,
                database_destroy: lib.required("strata_database_destroy")?,
                database_reboot_worker: lib.optional("strata_database_reboot_worker"),
                database_force_recovery_with_data_loss: lib
                    .optional("strata_database_force_recovery_with_data_loss"),
                database_create_snapshot: lib.optional("strata_database_create_snapshot"),
                database_get_main_thread_busyness: lib
                    .optional("strata_database_get_main_thread_busyness"),
                database_get_server_protocol: lib.optional("strata_database_get_server_protocol"),

                transaction_set_option: lib.required("strata_transaction_set_option")?,
                transaction_destroy: lib.required("strata_transaction_destroy")?,
                transaction_set_read_version: lib.required("strata_transaction_set_read_version")?,
                transaction_get_read_version: lib.required("strata_transaction_get_read_version")?,
                transaction_get: lib.required("strata_transaction_get")?,
                transaction_get_key: lib.required("strata_transaction_get_key")?,
                transaction_get_addresses_for_key: lib
                    .required("strata_transaction_get_addresses_for_key")?,
                transaction_get_range: lib.required("strata_transaction_get_range")?,
                transaction_get_versionstamp: lib.optional("strata_transaction_get_versionstamp"),
                transaction_set: lib.required("strata_transaction_set")?,
                transaction_clear: lib.required("strata_transaction_clear")?,
                transaction_clear_range: lib.required("strata_transaction_clear_range")?,
                transaction_atomic_op: lib.required("strata_transaction_atomic_op")?,
                transaction_get_estimated_range_size_bytes: lib
                    .optional("strata_transaction_get_estimated_range_size_bytes"),
                transaction_get_range_split_points: lib
                    .optional("strata_transaction_get_range_split_points"),
                transaction_commit: lib.required("strata_transaction_commit")?,
                transaction_get_committed_version: lib
                    .required("strata_transaction_get_committed_version")?,
                transaction_get_approximate_size: lib
                    .optional("strata_transaction_get_approximate_size"),
                transaction_watch: lib.required("strata_transaction_watch")?,
                transaction_on_error: lib.required("strata_transaction_on_error")?,
                transaction_reset: lib.required("strata_transaction_reset")?,
                transaction_cancel: lib.required("strata_transaction_cancel")?,
                transaction_add_conflict_range: lib
                    .required("strata_transaction_add_conflict_range")?,

                future_get_database: lib.required("strata_future_get_database")?,
                future_get_int64: lib.required("strata_future_get_int64")?,
                future_get_uint64: lib.required("strata_future_get_uint64")?,
                future_get_bool: lib.required("strata_future_get_bool")?,
                future_get_error: lib.required("strata_future_get_error")?,
                future_get_key: lib.required("strata_future_get_key")?,
                future_get_value: lib.required("strata_future_get_value")?,
                future_get_string_array: lib.required("strata_future_get_string_array")?,
                future_get_key_array: lib.required("strata_future_get_key_array")?,
                future_get_key_value_array: lib.required("strata_future_get_key_value_array")?,
                future_set_callback: lib.required("strata_future_set_callback")?,
                future_cancel: lib.required("strata_future_cancel")?,
                future_destroy: lib.required("strata_future_destroy")?,

                create_cluster: lib.optional("strata_create_cluster"),
                cluster_create_database: lib.optional("strata_cluster_create_database"),
                cluster_destroy: lib.optional("strata_cluster_destroy"),
                future_get_cluster: lib.optional("strata_future_get_cluster"),

                _lib: Some(lib),
            }))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A miniature in-process "client library" backing a [`CApiTable`]
    //! without dlopen, so the future bridge and adapters can be exercised
    //! against real function pointers.

    use super::*;
    use parking_lot::Mutex;

    /// In-process stand-in for a native future. Allocated by the fake entry
    /// points below and freed by `future_destroy`.
    pub(crate) struct FakeFuture {
        pub(crate) state: Mutex<FakeFutureState>,
    }

    #[derive(Default)]
    pub(crate) struct FakeFutureState {
        pub(crate) error: NativeError,
        pub(crate) int_value: i64,
        pub(crate) key: Vec<u8>,
        pub(crate) callback: Option<(FutureCallback, *mut c_void)>,
        pub(crate) fired: bool,
        pub(crate) cancelled: bool,
    }

    unsafe impl Send for FakeFutureState {}

    impl FakeFuture {
        pub(crate) fn create() -> *mut NativeFuture {
            Box::into_raw(Box::new(FakeFuture {
                state: Mutex::new(FakeFutureState::default()),
            })) as *mut NativeFuture
        }

        pub(crate) unsafe fn get(ptr: *mut NativeFuture) -> &'static FakeFuture {
            &*(ptr as *const FakeFuture)
        }

        /// Complete the fake future and fire any registered callback, the
        /// way a client's internal thread would.
        pub(crate) unsafe fn fire(ptr: *mut NativeFuture, error: NativeError, int_value: i64) {
            let fake = FakeFuture::get(ptr);
            let callback = {
                let mut state = fake.state.lock();
                if state.fired {
                    return;
                }
                state.fired = true;
                state.error = error;
                state.int_value = int_value;
                state.callback
            };
            if let Some((callback, user_data)) = callback {
                callback(ptr, user_data);
            }
        }
    }

    pub(crate) unsafe extern "C" fn fake_future_set_callback(
        future: *mut NativeFuture,
        callback: FutureCallback,
        user_data: *mut c_void,
    ) -> NativeError {
        let fake = FakeFuture::get(future);
        let fire_now = {
            let mut state = fake.state.lock();
            assert!(state.callback.is_none(), "second callback registration");
            if state.fired {
                true
            } else {
                state.callback = Some((callback, user_data));
                false
            }
        };
        if fire_now {
            callback(future, user_data);
        }
        0
    }

    pub(crate) unsafe extern "C" fn fake_future_get_error(future: *mut NativeFuture) -> NativeError {
        FakeFuture::get(future).state.lock().error
    }

    pub(crate) unsafe extern "C" fn fake_future_get_int64(
        future: *mut NativeFuture,
        out_value: *mut i64,
    ) -> NativeError {
        *out_value = FakeFuture::get(future).state.lock().int_value;
        0
    }

    pub(crate) unsafe extern "C" fn fake_future_get_uint64(
        future: *mut NativeFuture,
        out_value: *mut u64,
    ) -> NativeError {
        *out_value = FakeFuture::get(future).state.lock().int_value as u64;
        0
    }

    pub(crate) unsafe extern "C" fn fake_future_get_key(
        future: *mut NativeFuture,
        out_key: *mut *const u8,
        out_key_length: *mut c_int,
    ) -> NativeError {
        let state = FakeFuture::get(future).state.lock();
        *out_key = state.key.as_ptr();
        *out_key_length = state.key.len() as c_int;
        0
    }

    pub(crate) unsafe extern "C" fn fake_future_cancel(future: *mut NativeFuture) {
        {
            let fake = FakeFuture::get(future);
            let mut state = fake.state.lock();
            if state.fired {
                return;
            }
            state.cancelled = true;
        }
        FakeFuture::fire(future, crate::error::codes::OPERATION_CANCELLED, 0);
    }

    pub(crate) unsafe extern "C" fn fake_future_destroy(future: *mut NativeFuture) {
        drop(Box::from_raw(future as *mut FakeFuture));
    }

    unsafe extern "C" fn unreachable_error() -> NativeError {
        unreachable!("entry point not exercised by this test table")
    }

    unsafe extern "C" fn stub_select_api_version(_: c_int, _: c_int) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_set_network_option(_: c_int, _: *const u8, _: c_int) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_create_database(
        _: *const c_char,
        _: *mut *mut NativeDatabase,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_database_create_transaction(
        _: *mut NativeDatabase,
        _: *mut *mut NativeTransaction,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_database_set_option(
        _: *mut NativeDatabase,
        _: c_int,
        _: *const u8,
        _: c_int,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_database_destroy(_: *mut NativeDatabase) {}
    unsafe extern "C" fn stub_transaction_set_option(
        _: *mut NativeTransaction,
        _: c_int,
        _: *const u8,
        _: c_int,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_transaction_destroy(_: *mut NativeTransaction) {}
    unsafe extern "C" fn stub_transaction_set_read_version(_: *mut NativeTransaction, _: i64) {}
    unsafe extern "C" fn stub_transaction_future(_: *mut NativeTransaction) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_get(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: NativeBool,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_get_key(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: NativeBool,
        _: c_int,
        _: NativeBool,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_get_addresses(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn stub_transaction_get_range(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: NativeBool,
        _: c_int,
        _: *const u8,
        _: c_int,
        _: NativeBool,
        _: c_int,
        _: c_int,
        _: c_int,
        _: c_int,
        _: c_int,
        _: NativeBool,
        _: NativeBool,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_set(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: *const u8,
        _: c_int,
    ) {
    }
    unsafe extern "C" fn stub_transaction_clear(_: *mut NativeTransaction, _: *const u8, _: c_int) {}
    unsafe extern "C" fn stub_transaction_clear_range(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: *const u8,
        _: c_int,
    ) {
    }
    unsafe extern "C" fn stub_transaction_atomic_op(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: *const u8,
        _: c_int,
        _: c_int,
    ) {
    }
    unsafe extern "C" fn stub_transaction_get_committed_version(
        _: *mut NativeTransaction,
        out_version: *mut i64,
    ) -> NativeError {
        *out_version = 0;
        0
    }
    unsafe extern "C" fn stub_transaction_watch(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_on_error(
        _: *mut NativeTransaction,
        _: NativeError,
    ) -> *mut NativeFuture {
        FakeFuture::create()
    }
    unsafe extern "C" fn stub_transaction_reset(_: *mut NativeTransaction) {}
    unsafe extern "C" fn stub_transaction_cancel(_: *mut NativeTransaction) {}
    unsafe extern "C" fn stub_transaction_add_conflict_range(
        _: *mut NativeTransaction,
        _: *const u8,
        _: c_int,
        _: *const u8,
        _: c_int,
        _: c_int,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_future_get_database(
        _: *mut NativeFuture,
        _: *mut *mut NativeDatabase,
    ) -> NativeError {
        0
    }
    unsafe extern "C" fn stub_future_get_bool(
        _: *mut NativeFuture,
        out_value: *mut NativeBool,
    ) -> NativeError {
        *out_value = 0;
        0
    }
    unsafe extern "C" fn stub_future_get_value(
        _: *mut NativeFuture,
        out_present: *mut NativeBool,
        _: *mut *const u8,
        out_len: *mut c_int,
    ) -> NativeError {
        *out_present = 0;
        *out_len = 0;
        0
    }
    unsafe extern "C" fn stub_future_get_string_array(
        _: *mut NativeFuture,
        _: *mut *const *const c_char,
        out_count: *mut c_int,
    ) -> NativeError {
        *out_count = 0;
        0
    }
    unsafe extern "C" fn stub_future_get_key_array(
        _: *mut NativeFuture,
        _: *mut *const NativeKey,
        out_count: *mut c_int,
    ) -> NativeError {
        *out_count = 0;
        0
    }
    unsafe extern "C" fn stub_future_get_key_value_array(
        _: *mut NativeFuture,
        _: *mut *const NativeKeyValue,
        out_count: *mut c_int,
        out_more: *mut NativeBool,
    ) -> NativeError {
        *out_count = 0;
        *out_more = 0;
        0
    }

    /// A table whose future entry points are live fakes and whose other
    /// entry points are inert stubs. Returned by value so tests can swap
    /// individual entries before sharing it.
    pub(crate) fn fake_table() -> CApiTable {
        CApiTable {
            _lib: None,
            select_api_version: stub_select_api_version,
            get_client_version: None,
            set_network_option: stub_set_network_option,
            setup_network: unreachable_error,
            run_network: unreachable_error,
            stop_network: unreachable_error,
            create_database: stub_create_database,
            database_create_transaction: stub_database_create_transaction,
            database_set_option: stub_database_set_option,
            database_destroy: stub_database_destroy,
            database_reboot_worker: None,
            database_force_recovery_with_data_loss: None,
            database_create_snapshot: None,
            database_get_main_thread_busyness: None,
            database_get_server_protocol: None,
            transaction_set_option: stub_transaction_set_option,
            transaction_destroy: stub_transaction_destroy,
            transaction_set_read_version: stub_transaction_set_read_version,
            transaction_get_read_version: stub_transaction_future,
            transaction_get: stub_transaction_get,
            transaction_get_key: stub_transaction_get_key,
            transaction_get_addresses_for_key: stub_transaction_get_addresses,
            transaction_get_range: stub_transaction_get_range,
            transaction_get_versionstamp: None,
            transaction_set: stub_transaction_set,
            transaction_clear: stub_transaction_clear,
            transaction_clear_range: stub_transaction_clear_range,
            transaction_atomic_op: stub_transaction_atomic_op,
            transaction_get_estimated_range_size_bytes: None,
            transaction_get_range_split_points: None,
            transaction_commit: stub_transaction_future,
            transaction_get_committed_version: stub_transaction_get_committed_version,
            transaction_get_approximate_size: None,
            transaction_watch: stub_transaction_watch,
            transaction_on_error: stub_transaction_on_error,
            transaction_reset: stub_transaction_reset,
            transaction_cancel: stub_transaction_cancel,
            transaction_add_conflict_range: stub_transaction_add_conflict_range,
            future_get_database: stub_future_get_database,
            future_get_int64: fake_future_get_int64,
            future_get_uint64: fake_future_get_uint64,
            future_get_bool: stub_future_get_bool,
            future_get_error: fake_future_get_error,
            future_get_key: fake_future_get_key,
            future_get_value: stub_future_get_value,
            future_get_string_array: stub_future_get_string_array,
            future_get_key_array: stub_future_get_key_array,
            future_get_key_value_array: stub_future_get_key_value_array,
            future_set_callback: fake_future_set_callback,
            future_cancel: fake_future_cancel,
            future_destroy: fake_future_destroy,
            create_cluster: None,
            cluster_create_database: None,
            cluster_destroy: None,
            future_get_cluster: None,
        }
    }
}
