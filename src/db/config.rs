/// Storage configuration handed to [`Database::open`](super::Database::open).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum resident pages in the buffer pool.
    pub pool_capacity: usize,
    /// Whether to open a write-ahead log next to the data file.
    pub wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_capacity: 1024,
            wal: true,
        }
    }
}

impl Config {
    /// Durability off: no WAL, pages reach the backend only on
    /// flush/checkpoint/close. Useful for bulk loads and scratch databases.
    pub fn cache_only() -> Self {
        Self {
            wal: false,
            ..Self::default()
        }
    }

    /// Overrides the buffer pool capacity.
    pub fn with_pool_capacity(mut self, pages: usize) -> Self {
        self.pool_capacity = pages;
        self
    }
}
