//! Scoped engine transaction.
//!
//! `begin` acquires, `commit` consumes; any other exit path (early return,
//! `?`, panic unwind) aborts in `Drop`. A failed commit leaves the engine
//! auto-aborted, so the guard must not abort again on top of it.

use tracing::warn;

use crate::{EngineSession, WfpError, WfpResult};

pub struct Transaction<'e> {
    session: &'e mut dyn EngineSession,
    finished: bool,
}

impl<'e> Transaction<'e> {
    pub fn begin(session: &'e mut dyn EngineSession) -> WfpResult<Self> {
        session.begin_transaction()?;
        Ok(Self {
            session,
            finished: false,
        })
    }

    /// The session, for work inside the transaction scope.
    pub fn session(&mut self) -> &mut dyn EngineSession {
        self.session
    }

    pub fn commit(mut self) -> WfpResult<()> {
        self.finished = true;
        self.session.commit_transaction()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.session.abort_transaction() {
            // Nothing to propagate from a drop; the session is being torn
            // down either way.
            if err != WfpError::SessionAborted {
                warn!(?err, "transaction abort failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::{EngineBackend, ProviderSpec};
    use uuid::Uuid;

    fn provider() -> ProviderSpec {
        ProviderSpec {
            key: Uuid::from_u128(1),
            name: "p".into(),
            description: String::new(),
        }
    }

    #[test]
    fn drop_without_commit_aborts() {
        let backend = MemoryBackend::new();
        let mut session = backend.open().unwrap();
        {
            let mut txn = Transaction::begin(session.as_mut()).unwrap();
            txn.session().add_provider(&provider()).unwrap();
            // txn dropped here without commit
        }
        assert!(!session.provider_exists(Uuid::from_u128(1)).unwrap());
    }

    #[test]
    fn commit_publishes() {
        let backend = MemoryBackend::new();
        let mut session = backend.open().unwrap();
        let mut txn = Transaction::begin(session.as_mut()).unwrap();
        txn.session().add_provider(&provider()).unwrap();
        txn.commit().unwrap();
        assert!(session.provider_exists(Uuid::from_u128(1)).unwrap());
    }

    #[test]
    fn second_begin_on_same_session_is_refused() {
        let backend = MemoryBackend::new();
        let mut session = backend.open().unwrap();
        session.begin_transaction().unwrap();
        let err = session.begin_transaction().unwrap_err();
        assert_eq!(
            err.status(),
            crate::error::codes::FWP_E_TXN_IN_PROGRESS
        );
    }
}
