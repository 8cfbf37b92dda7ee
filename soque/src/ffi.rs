// C ABI surface. A process-static table of version fields plus function
// pointers over the whole API, reachable through the single exported symbol
// `soque_framework`. Clients check `major` before using the table; `minor`
// drift is compatible.
use crate::soque::Soque;
use crate::threads::SoqueThreads;
use crate::SoqueHandler;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::ptr;
use std::sync::Arc;

pub const SOQUE_MAJOR: c_int = 1;
pub const SOQUE_MINOR: c_int = 0;

pub type SoquePushCb =
    unsafe extern "C" fn(arg: *mut c_void, count: c_uint, waitable: c_char) -> c_uint;
pub type SoqueProcCb = unsafe extern "C" fn(arg: *mut c_void, count: c_uint, index: c_uint);
pub type SoquePopCb =
    unsafe extern "C" fn(arg: *mut c_void, count: c_uint, waitable: c_char) -> c_uint;

pub type SoqueHandle = *const Soque;
pub type SoqueThreadsHandle = *mut SoqueThreads;

// Adapter from the C callback triple to the handler trait. The caller is
// responsible for the thread safety of whatever `arg` points at.
struct CallbackShim {
    arg: *mut c_void,
    push: SoquePushCb,
    proc: SoqueProcCb,
    pop: SoquePopCb,
}

unsafe impl Send for CallbackShim {}
unsafe impl Sync for CallbackShim {}

impl SoqueHandler for CallbackShim {
    fn push(&self, available: usize, waitable: bool) -> usize {
        unsafe { (self.push)(self.arg, available as c_uint, c_char::from(waitable)) as usize }
    }

    fn proc(&self, index: usize, count: usize) {
        unsafe { (self.proc)(self.arg, count as c_uint, index as c_uint) }
    }

    fn pop(&self, ready: usize, waitable: bool) -> usize {
        unsafe { (self.pop)(self.arg, ready as c_uint, c_char::from(waitable)) as usize }
    }
}

unsafe extern "C" fn soque_open(
    size: c_uint,
    arg: *mut c_void,
    push: SoquePushCb,
    proc: SoqueProcCb,
    pop: SoquePopCb,
) -> SoqueHandle {
    if size < 2 {
        return ptr::null();
    }
    let handler: Arc<dyn SoqueHandler> = Arc::new(CallbackShim {
        arg,
        push,
        proc,
        pop,
    });
    Arc::into_raw(Arc::new(Soque::with_capacity(size as usize, handler)))
}

unsafe extern "C" fn soque_push(sh: SoqueHandle, count: c_uint) -> c_uint {
    (*sh).push(count as usize) as c_uint
}

unsafe extern "C" fn soque_proc_get(sh: SoqueHandle, count: c_uint, index: *mut c_uint) -> c_uint {
    let (claim_index, claim_count) = (*sh).proc_get(count as usize);
    *index = claim_index as c_uint;
    claim_count as c_uint
}

unsafe extern "C" fn soque_proc_done(sh: SoqueHandle, count: c_uint, index: c_uint) {
    (*sh).proc_done(index as usize, count as usize);
}

unsafe extern "C" fn soque_pop(sh: SoqueHandle, count: c_uint) -> c_uint {
    (*sh).pop(count as usize) as c_uint
}

unsafe extern "C" fn soque_pp_enter(sh: SoqueHandle) -> c_char {
    c_char::from((*sh).pp_enter())
}

unsafe extern "C" fn soque_pp_leave(sh: SoqueHandle) {
    (*sh).pp_leave();
}

unsafe extern "C" fn soque_close(sh: SoqueHandle) {
    drop(Arc::from_raw(sh));
}

unsafe extern "C" fn soque_threads_open(
    threads: c_uint,
    bind: c_char,
    shs: *const SoqueHandle,
    shs_count: c_uint,
) -> SoqueThreadsHandle {
    if shs.is_null() || shs_count == 0 {
        return ptr::null_mut();
    }
    for k in 0..shs_count as usize {
        if (*shs.add(k)).is_null() {
            return ptr::null_mut();
        }
    }

    // The pool holds its own references; the caller's handles stay valid
    // until soque_close.
    let mut queues = Vec::with_capacity(shs_count as usize);
    for k in 0..shs_count as usize {
        let sh = *shs.add(k);
        Arc::increment_strong_count(sh);
        queues.push(Arc::from_raw(sh));
    }

    Box::into_raw(Box::new(SoqueThreads::open(
        threads as usize,
        bind != 0,
        queues,
    )))
}

unsafe extern "C" fn soque_threads_tune(
    sth: SoqueThreadsHandle,
    batch: c_uint,
    threshold: c_uint,
    reaction: c_uint,
) {
    (*sth).tune(batch as usize, threshold, u64::from(reaction));
}

unsafe extern "C" fn soque_threads_close(sth: SoqueThreadsHandle) {
    drop(Box::from_raw(sth));
}

#[repr(C)]
pub struct SoqueFramework {
    pub major: c_int,
    pub minor: c_int,
    pub open: unsafe extern "C" fn(
        c_uint,
        *mut c_void,
        SoquePushCb,
        SoqueProcCb,
        SoquePopCb,
    ) -> SoqueHandle,
    pub push: unsafe extern "C" fn(SoqueHandle, c_uint) -> c_uint,
    pub proc_get: unsafe extern "C" fn(SoqueHandle, c_uint, *mut c_uint) -> c_uint,
    pub proc_done: unsafe extern "C" fn(SoqueHandle, c_uint, c_uint),
    pub pop: unsafe extern "C" fn(SoqueHandle, c_uint) -> c_uint,
    pub pp_enter: unsafe extern "C" fn(SoqueHandle) -> c_char,
    pub pp_leave: unsafe extern "C" fn(SoqueHandle),
    pub close: unsafe extern "C" fn(SoqueHandle),
    pub threads_open:
        unsafe extern "C" fn(c_uint, c_char, *const SoqueHandle, c_uint) -> SoqueThreadsHandle,
    pub threads_tune: unsafe extern "C" fn(SoqueThreadsHandle, c_uint, c_uint, c_uint),
    pub threads_close: unsafe extern "C" fn(SoqueThreadsHandle),
}

static FRAMEWORK: SoqueFramework = SoqueFramework {
    major: SOQUE_MAJOR,
    minor: SOQUE_MINOR,
    open: soque_open,
    push: soque_push,
    proc_get: soque_proc_get,
    proc_done: soque_proc_done,
    pop: soque_pop,
    pp_enter: soque_pp_enter,
    pp_leave: soque_pp_leave,
    close: soque_close,
    threads_open: soque_threads_open,
    threads_tune: soque_threads_tune,
    threads_close: soque_threads_close,
};

/// Entry point resolved by dynamic loaders.
#[no_mangle]
pub extern "C" fn soque_framework() -> *const SoqueFramework {
    &FRAMEWORK
}
