use crate::{backend::Backend, config::Config, handle::HandleTable, resolver::Resolver};
use std::fmt;

/// The state shared by every operation of a mount session.
pub struct Driver<B> {
    backend: B,
    handles: HandleTable,
    resolver: Resolver,
    config: Config,
}

impl<B: fmt::Debug> fmt::Debug for Driver<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("backend", &self.backend)
            .field("handles", &self.handles)
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish()
    }
}

impl<B: Backend> Driver<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self {
            handles: HandleTable::new(),
            resolver: Resolver::new(config.get_lease()),
            backend,
            config,
        }
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    #[inline]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return whether mutations must be rejected.
    pub(crate) fn is_read_only(&self) -> bool {
        self.config.is_read_only() || self.backend.is_read_only()
    }

    /// Drop every open handle and cached binding.
    pub fn teardown(&self) {
        let handles = self.handles.len();
        self.handles.clear();
        self.resolver.clear();
        tracing::debug!(handles, "driver state torn down");
    }
}
