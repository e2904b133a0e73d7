//! Bridges the callback-based native future into a Rust [`Future`].
//!
//! The native side registers a one-shot callback that may fire on any
//! internal thread of the loaded library. The trampoline only records
//! readiness and wakes the stored waker; result extraction happens at poll
//! time on the caller's thread, copying everything out of memory owned by
//! the native handle. Each registration hands the trampoline its own
//! reference to the shared state, consumed exactly once when the callback
//! fires, so the handle cannot be destroyed with a completion in flight.

use std::ffi::CStr;
use std::future::Future;
use std::os::raw::{c_int, c_void};
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::capi::{
    CApiTable, NativeBool, NativeCluster, NativeDatabase, NativeFuture, NativeKey, NativeKeyValue,
};
use crate::error::{ClientError, ClientResult};
use crate::traits::{KeyValue, RangeResult};

/// Unique owner of a native future pointer; destroys it on drop.
pub(crate) struct FutureHandle {
    ptr: NonNull<NativeFuture>,
    api: Arc<CApiTable>,
}

unsafe impl Send for FutureHandle {}
unsafe impl Sync for FutureHandle {}

impl FutureHandle {
    pub(crate) fn new(ptr: *mut NativeFuture, api: Arc<CApiTable>) -> ClientResult<FutureHandle> {
        NonNull::new(ptr)
            .map(|ptr| FutureHandle { ptr, api })
            .ok_or(ClientError::NullPointer)
    }

    fn as_ptr(&self) -> *mut NativeFuture {
        self.ptr.as_ptr()
    }
}

impl Drop for FutureHandle {
    fn drop(&mut self) {
        unsafe {
            (self.api.future_destroy)(self.ptr.as_ptr());
        }
    }
}

/// Copies the typed payload out of a ready, non-errored native future.
pub(crate) type Extract<T> = unsafe fn(&CApiTable, *mut NativeFuture) -> ClientResult<T>;

struct BridgeState {
    ready: bool,
    waker: Option<Waker>,
    // Set when callback registration itself failed; reported at first poll.
    register_error: Option<ClientError>,
}

struct BridgeShared<T> {
    handle: FutureHandle,
    extract: Extract<T>,
    state: Mutex<BridgeState>,
}

/// A typed async value backed by a native future from a loaded client.
pub(crate) struct DlFuture<T> {
    shared: Arc<BridgeShared<T>>,
    done: bool,
}

impl<T: Send + 'static> DlFuture<T> {
    pub(crate) fn new(handle: FutureHandle, extract: Extract<T>) -> DlFuture<T> {
        let shared = Arc::new(BridgeShared {
            handle,
            extract,
            state: Mutex::new(BridgeState {
                ready: false,
                waker: None,
                register_error: None,
            }),
        });

        // The trampoline's reference; consumed exactly once when it fires.
        let user_data = Arc::into_raw(shared.clone()) as *mut c_void;
        let rc = unsafe {
            (shared.handle.api.future_set_callback)(
                shared.handle.as_ptr(),
                ready_trampoline::<T>,
                user_data,
            )
        };
        if rc != 0 {
            // Registration failed, so the trampoline will never run; reclaim
            // its reference and surface the failure at poll time.
            unsafe {
                drop(Arc::from_raw(user_data as *const BridgeShared<T>));
            }
            let mut state = shared.state.lock();
            state.ready = true;
            state.register_error = Some(ClientError::from_code(rc));
        }

        DlFuture {
            shared,
            done: false,
        }
    }

    /// Wrap a freshly issued native call in one step.
    pub(crate) fn from_ptr(
        ptr: *mut NativeFuture,
        api: Arc<CApiTable>,
        extract: Extract<T>,
    ) -> ClientResult<DlFuture<T>> {
        Ok(DlFuture::new(FutureHandle::new(ptr, api)?, extract))
    }
}

impl<T: Send + 'static> Future for DlFuture<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if !state.ready {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if let Some(err) = state.register_error.take() {
            drop(state);
            self.done = true;
            return Poll::Ready(Err(err));
        }
        drop(state);
        self.done = true;

        let api: &CApiTable = &self.shared.handle.api;
        let ptr = self.shared.handle.as_ptr();
        let result = unsafe {
            let rc = (api.future_get_error)(ptr);
            if rc != 0 {
                Err(ClientError::from_code(rc))
            } else {
                (self.shared.extract)(api, ptr)
            }
        };
        Poll::Ready(result)
    }
}

impl<T> Unpin for DlFuture<T> {}

impl<T> Drop for DlFuture<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let pending = !self.shared.state.lock().ready;
        if pending {
            // The native side fires the callback with OPERATION_CANCELLED,
            // which releases the trampoline's reference.
            unsafe {
                (self.shared.handle.api.future_cancel)(self.shared.handle.as_ptr());
            }
        }
    }
}

unsafe extern "C" fn ready_trampoline<T: Send + 'static>(
    _future: *mut NativeFuture,
    user_data: *mut c_void,
) {
    let shared = unsafe { Arc::from_raw(user_data as *const BridgeShared<T>) };
    let waker = {
        let mut state = shared.state.lock();
        state.ready = true;
        state.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
    // Dropping `shared` releases the trampoline's reference.
}

// Extraction helpers. All of them run on a ready future whose error slot was
// already checked, and copy out of native memory before returning.

fn copy_bytes(ptr: *const u8, len: c_int) -> Vec<u8> {
    if ptr.is_null() || len <= 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize).to_vec() }
}

fn check(rc: c_int) -> ClientResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ClientError::from_code(rc))
    }
}

pub(crate) unsafe fn extract_unit(_api: &CApiTable, _f: *mut NativeFuture) -> ClientResult<()> {
    Ok(())
}

pub(crate) unsafe fn extract_int64(api: &CApiTable, f: *mut NativeFuture) -> ClientResult<i64> {
    let mut value = 0i64;
    check((api.future_get_int64)(f, &mut value))?;
    Ok(value)
}

pub(crate) unsafe fn extract_uint64(api: &CApiTable, f: *mut NativeFuture) -> ClientResult<u64> {
    let mut value = 0u64;
    check((api.future_get_uint64)(f, &mut value))?;
    Ok(value)
}

#[allow(dead_code)]
pub(crate) unsafe fn extract_bool(api: &CApiTable, f: *mut NativeFuture) -> ClientResult<bool> {
    let mut value: NativeBool = 0;
    check((api.future_get_bool)(f, &mut value))?;
    Ok(value != 0)
}

pub(crate) unsafe fn extract_key(api: &CApiTable, f: *mut NativeFuture) -> ClientResult<Vec<u8>> {
    let mut key: *const u8 = ptr::null();
    let mut len: c_int = 0;
    check((api.future_get_key)(f, &mut key, &mut len))?;
    Ok(copy_bytes(key, len))
}

pub(crate) unsafe fn extract_value(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<Option<Vec<u8>>> {
    let mut present: NativeBool = 0;
    let mut value: *const u8 = ptr::null();
    let mut len: c_int = 0;
    check((api.future_get_value)(f, &mut present, &mut value, &mut len))?;
    if present == 0 {
        Ok(None)
    } else {
        Ok(Some(copy_bytes(value, len)))
    }
}

pub(crate) unsafe fn extract_string_array(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<Vec<String>> {
    let mut strings: *const *const std::os::raw::c_char = ptr::null();
    let mut count: c_int = 0;
    check((api.future_get_string_array)(f, &mut strings, &mut count))?;
    let mut out = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count.max(0) as usize {
        let entry = *strings.add(i);
        if entry.is_null() {
            continue;
        }
        out.push(CStr::from_ptr(entry).to_string_lossy().into_owned());
    }
    Ok(out)
}

pub(crate) unsafe fn extract_key_array(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<Vec<Vec<u8>>> {
    let mut keys: *const NativeKey = ptr::null();
    let mut count: c_int = 0;
    check((api.future_get_key_array)(f, &mut keys, &mut count))?;
    let mut out = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count.max(0) as usize {
        let entry = *keys.add(i);
        out.push(copy_bytes(entry.key, entry.key_length));
    }
    Ok(out)
}

pub(crate) unsafe fn extract_key_value_array(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<RangeResult> {
    let mut kvs: *const NativeKeyValue = ptr::null();
    let mut count: c_int = 0;
    let mut more: NativeBool = 0;
    check((api.future_get_key_value_array)(f, &mut kvs, &mut count, &mut more))?;
    let mut out = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count.max(0) as usize {
        let entry = *kvs.add(i);
        out.push(KeyValue {
            key: copy_bytes(entry.key, entry.key_length),
            value: copy_bytes(entry.value, entry.value_length),
        });
    }
    Ok(RangeResult {
        kvs: out,
        more: more != 0,
    })
}

/// Raw database pointer with ownership transferred out of the future.
pub(crate) struct RawDatabase(pub(crate) *mut NativeDatabase);
unsafe impl Send for RawDatabase {}

pub(crate) unsafe fn extract_database(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<RawDatabase> {
    let mut db: *mut NativeDatabase = ptr::null_mut();
    check((api.future_get_database)(f, &mut db))?;
    if db.is_null() {
        return Err(ClientError::NullPointer);
    }
    Ok(RawDatabase(db))
}

/// Raw cluster pointer with ownership transferred out of the future.
pub(crate) struct RawCluster(pub(crate) *mut NativeCluster);
unsafe impl Send for RawCluster {}

pub(crate) unsafe fn extract_cluster(
    api: &CApiTable,
    f: *mut NativeFuture,
) -> ClientResult<RawCluster> {
    let get_cluster = api
        .future_get_cluster
        .ok_or(ClientError::UnsupportedOperation)?;
    let mut cluster: *mut NativeCluster = ptr::null_mut();
    check(get_cluster(f, &mut cluster))?;
    if cluster.is_null() {
        return Err(ClientError::NullPointer);
    }
    Ok(RawCluster(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::test_support::{fake_table, FakeFuture};
    use crate::error::codes;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        unsafe fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(ptr::null(), &VTABLE)
        }
        unsafe fn wake(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake, wake);
        let raw = RawWaker::new(ptr::null(), &VTABLE);
        unsafe { Waker::from_raw(raw) }
    }

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn resolves_after_callback_fires() {
        let api = Arc::new(fake_table());
        let ptr = FakeFuture::create();
        let mut future =
            DlFuture::<i64>::from_ptr(ptr, api, extract_int64).expect("bridge future");

        assert!(matches!(poll_once(&mut future), Poll::Pending));
        unsafe { FakeFuture::fire(ptr, 0, 42) };

        match poll_once(&mut future) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 42),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn completion_before_registration_resolves_immediately() {
        let api = Arc::new(fake_table());
        let ptr = FakeFuture::create();
        unsafe { FakeFuture::fire(ptr, 0, 7) };

        let mut future =
            DlFuture::<i64>::from_ptr(ptr, api, extract_int64).expect("bridge future");
        match poll_once(&mut future) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 7),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn native_errors_are_classified() {
        let api = Arc::new(fake_table());
        let ptr = FakeFuture::create();
        let mut future =
            DlFuture::<i64>::from_ptr(ptr, api, extract_int64).expect("bridge future");

        unsafe { FakeFuture::fire(ptr, codes::TRANSACTION_CANCELLED, 0) };
        match poll_once(&mut future) {
            Poll::Ready(Err(ClientError::TransactionCancelled)) => {}
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn drop_cancels_pending_future() {
        let api = Arc::new(fake_table());
        let ptr = FakeFuture::create();
        let future = DlFuture::<i64>::from_ptr(ptr, api, extract_int64).expect("bridge future");
        // Dropping unresolved cancels the native future, which fires the
        // callback with OPERATION_CANCELLED and releases every reference.
        drop(future);
    }

    #[test]
    fn key_extraction_copies_out_of_native_memory() {
        let api = Arc::new(fake_table());
        let ptr = FakeFuture::create();
        unsafe {
            FakeFuture::get(ptr).state.lock().key = b"hello".to_vec();
            FakeFuture::fire(ptr, 0, 0);
        }
        let mut future =
            DlFuture::<Vec<u8>>::from_ptr(ptr, api, extract_key).expect("bridge future");
        match poll_once(&mut future) {
            Poll::Ready(Ok(key)) => assert_eq!(key, b"hello"),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }
}
