use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Acquire the lock, recovering the guard when a previous holder panicked.
///
/// Every critical section in this crate is a single map mutation, so the
/// protected state is structurally valid even after a poisoning panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err: PoisonError<_>| {
        tracing::warn!("recovered a poisoned lock");
        err.into_inner()
    })
}

/// Split a timestamp into the `(secs, nsecs)` pair used on the wire.
pub(crate) fn to_raw_time(time: SystemTime) -> (u64, u32) {
    let d = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (d.as_secs(), d.subsec_nanos())
}
