//! The entry point handing control flow over to a transport.

use crate::{backend::Backend, driver::Driver, table::OperationTable};
use std::{ffi::OsString, sync::Arc};

/// A source of requests and a sink of replies.
///
/// A transport feeds requests into the operation table until the
/// filesystem is unmounted, and returns the exit status of the session.
pub trait Transport {
    fn run<B: Backend>(
        self,
        args: &[OsString],
        table: &OperationTable<B>,
        driver: &Arc<Driver<B>>,
    ) -> i32;
}

/// Serve the filesystem described by `table` and `driver` through `transport`.
///
/// The call blocks until the transport returns. The driver state is torn
/// down before the exit status is passed through; `0` means a clean unmount.
pub fn main<B, T>(
    args: &[OsString],
    table: &OperationTable<B>,
    driver: &Arc<Driver<B>>,
    transport: T,
) -> i32
where
    B: Backend,
    T: Transport,
{
    tracing::info!(?args, "starting session");

    let status = transport.run(args, table, driver);
    driver.teardown();

    if status == 0 {
        tracing::info!("session ended");
    } else {
        tracing::warn!(status, "session ended abnormally");
    }
    status
}
