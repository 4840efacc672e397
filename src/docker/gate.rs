use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide mutual exclusion for container-runtime mutations.
///
/// Requesters never queue behind the protocol: the dispatcher inspects
/// [`MutationGate::is_held`] without acquiring and rejects with BUSY, while
/// the operations themselves await [`MutationGate::acquire`].
#[derive(Clone)]
pub struct MutationGate(Arc<Semaphore>);

impl MutationGate {
    pub fn new() -> Self {
        Self(Arc::new(Semaphore::new(1)))
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.0
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed")
    }

    /// Non-blocking held-state inspection.
    pub fn is_held(&self) -> bool {
        self.0.available_permits() == 0
    }
}

impl Default for MutationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn held_while_permit_alive() {
        let gate = MutationGate::new();
        assert!(!gate.is_held());

        let permit = gate.acquire().await;
        assert!(gate.is_held());

        drop(permit);
        assert!(!gate.is_held());
    }
}
