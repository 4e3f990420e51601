/// Tunables for the synchronization layer. The binary fills this from the
/// environment; the library never reads it directly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace prepended to every cache key.
    pub key_prefix: String,
    /// Page size used when a range request does not name one.
    pub page_limit: usize,
    /// Upper bound applied to every requested page size.
    pub max_page_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            key_prefix: "murmur".into(),
            page_limit: 100,
            max_page_limit: 1000,
        }
    }
}

impl SyncConfig {
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.page_limit).min(self.max_page_limit)
    }
}
