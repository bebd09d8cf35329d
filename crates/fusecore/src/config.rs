use std::time::Duration;

/// The default upper bound of the payload of a single `write`.
pub const DEFAULT_MAX_WRITE: u32 = 16 * 1024 * 1024;

/// The default upper bound of the length of an entry name, in bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 255;

/// Driver settings.
#[derive(Clone, Debug)]
pub struct Config {
    entry_ttl: Duration,
    attr_ttl: Duration,
    lease: Duration,
    read_only: bool,
    check_permissions: bool,
    dot_entries: bool,
    max_write: u32,
    max_name_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(1),
            attr_ttl: Duration::from_secs(1),
            lease: Duration::from_secs(1),
            read_only: false,
            check_permissions: true,
            dot_entries: true,
            max_write: DEFAULT_MAX_WRITE,
            max_name_len: DEFAULT_MAX_NAME_LEN,
        }
    }
}

impl Config {
    /// Set how long the kernel may cache name lookups.
    pub fn entry_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set how long the kernel may cache node attributes.
    pub fn attr_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.attr_ttl = ttl;
        self
    }

    /// Set the lease of the resolution cache.
    ///
    /// Within its lease a cached name is trusted without asking the backend
    /// to resolve it again. A zero lease disables the cache.
    pub fn lease(&mut self, lease: Duration) -> &mut Self {
        self.lease = lease;
        self
    }

    /// Reject every mutating operation with `EROFS`.
    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    /// Check permission bits against the caller's credentials.
    ///
    /// The default value is `true`.
    pub fn check_permissions(&mut self, enabled: bool) -> &mut Self {
        self.check_permissions = enabled;
        self
    }

    /// Include `.` and `..` in directory listings.
    ///
    /// The default value is `true`.
    pub fn dot_entries(&mut self, enabled: bool) -> &mut Self {
        self.dot_entries = enabled;
        self
    }

    /// Set the maximum payload of a single `write`.
    ///
    /// Larger writes are cut short to this size.
    pub fn max_write(&mut self, value: u32) -> &mut Self {
        self.max_write = value.max(1);
        self
    }

    /// Set the maximum length of an entry name.
    pub fn max_name_len(&mut self, value: usize) -> &mut Self {
        self.max_name_len = value;
        self
    }

    pub(crate) fn get_entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    pub(crate) fn get_attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    pub(crate) fn get_lease(&self) -> Duration {
        self.lease
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn checks_permissions(&self) -> bool {
        self.check_permissions
    }

    pub(crate) fn has_dot_entries(&self) -> bool {
        self.dot_entries
    }

    pub(crate) fn get_max_write(&self) -> u32 {
        self.max_write
    }

    pub(crate) fn get_max_name_len(&self) -> usize {
        self.max_name_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_setters() {
        let mut config = Config::default();
        config
            .lease(Duration::ZERO)
            .read_only(true)
            .max_write(0)
            .dot_entries(false);
        assert_eq!(config.get_lease(), Duration::ZERO);
        assert!(config.is_read_only());
        assert_eq!(config.get_max_write(), 1);
        assert!(!config.has_dot_entries());
        assert!(config.checks_permissions());
        assert_eq!(config.get_max_name_len(), DEFAULT_MAX_NAME_LEN);
    }
}
