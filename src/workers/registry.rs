//! Static, ordered registry of worker endpoints.

use crate::error::WorkerError;

/// Ordered list of worker endpoints, fixed at startup.
///
/// Workers are addressed by their 1-based position in the list. The registry
/// is immutable once built, so it can be shared behind an `Arc` and read
/// concurrently without locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistry {
    endpoints: Vec<String>,
}

impl WorkerRegistry {
    /// Builds a registry from an ordered list of base URLs.
    ///
    /// Trailing slashes are trimmed so routes can be appended directly.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::EmptyRegistry` for an empty list and
    /// `WorkerError::InvalidEndpoint` for URLs that are not `http(s)://`.
    pub fn from_urls<I, S>(urls: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut endpoints = Vec::new();
        for url in urls {
            let url = url.as_ref().trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(WorkerError::InvalidEndpoint {
                    url: url.to_string(),
                    reason: "expected an http:// or https:// URL".to_string(),
                });
            }
            endpoints.push(url.trim_end_matches('/').to_string());
        }

        if endpoints.is_empty() {
            return Err(WorkerError::EmptyRegistry);
        }

        Ok(Self { endpoints })
    }

    /// Number of configured workers.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false for a constructed registry; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Returns whether `index` names a configured worker.
    pub fn contains(&self, index: usize) -> bool {
        (1..=self.endpoints.len()).contains(&index)
    }

    /// Resolves a 1-based worker index to its base URL.
    pub fn endpoint(&self, index: usize) -> Result<&str, WorkerError> {
        if !self.contains(index) {
            return Err(WorkerError::InvalidWorkerIndex {
                index,
                count: self.endpoints.len(),
            });
        }
        Ok(&self.endpoints[index - 1])
    }

    /// Worker indices in dispatch order.
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        1..=self.endpoints.len()
    }
}
