//! Admission Collector: write path into the Correlation Store.
//!
//! Invoked from the admission webhook handler and the audit ingress handler
//! in `reverser-server`, and directly by same-process callers in tests; has
//! no HTTP awareness of its own. Never fails the admission path: errors are
//! swallowed, since admission must succeed even if the cache is full.

use std::sync::Arc;

use reverser_types::{Operation, ResourceFingerprint, ResourceIdentifier, UserInfo};

use crate::correlation::CorrelationStore;

pub struct AdmissionCollector {
    correlation: Arc<CorrelationStore>,
}

impl AdmissionCollector {
    pub fn new(correlation: Arc<CorrelationStore>) -> Self {
        Self { correlation }
    }

    /// Record the user that performed `operation` on `identifier`. Last
    /// writer wins for a given `(identifier, operation)` pair, matching
    /// `CorrelationStore::put`'s overwrite semantics; never returns an error.
    pub async fn record(&self, identifier: ResourceIdentifier, operation: Operation, user: UserInfo) {
        let fingerprint = ResourceFingerprint::new(identifier, operation);
        self.correlation.put(fingerprint, user).await;
    }
}
