/// Tunables for the page cache.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hard bound on attached pages; eviction starts once the LRU
    /// reaches this length.
    pub(crate) max_lru_size: usize,
    /// Soft lower bound: one eviction pass stops shrinking the LRU once
    /// it drops below this length and free buffers are at hand.
    pub(crate) min_lru_size: usize,
}

impl Options {
    /// The defaults: 1024 cached pages, evicting down to 512.
    pub fn new() -> Self {
        Options {
            max_lru_size: 1024,
            min_lru_size: 512,
        }
    }

    /// Set the hard bound on attached pages.
    pub fn max_lru_size(&mut self, value: usize) -> &mut Self {
        self.max_lru_size = value;
        self
    }

    /// Set the soft lower bound an eviction pass shrinks towards.
    pub fn min_lru_size(&mut self, value: usize) -> &mut Self {
        self.min_lru_size = value;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
