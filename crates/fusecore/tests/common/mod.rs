#![allow(dead_code)]

use fusecore::{channel, channel::Client, Backend, Config, Driver, MemStore, OperationTable};
use std::{sync::Arc, thread};

/// Serve `store` on a loopback transport while `f` drives it.
///
/// The session is unmounted once `f` returns, and must end cleanly.
pub fn mount_with<B, F, T>(store: B, config: Config, table: OperationTable<B>, f: F) -> T
where
    B: Backend,
    F: FnOnce(&Client, &Driver<B>) -> T,
{
    let (transport, client) = channel::pair();
    let driver = Arc::new(Driver::new(store, config));
    let (driver, table) = (&driver, &table);

    thread::scope(move |scope| {
        let server = scope.spawn(move || fusecore::main(&[], table, driver, transport));
        let out = f(&client, &**driver);
        client.unmount();
        let status = server.join().expect("the server panicked");
        assert_eq!(status, 0, "unclean unmount");
        out
    })
}

pub fn mount<F, T>(f: F) -> T
where
    F: FnOnce(&Client, &Driver<MemStore>) -> T,
{
    mount_with(
        MemStore::new(),
        Config::default(),
        OperationTable::default(),
        f,
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
