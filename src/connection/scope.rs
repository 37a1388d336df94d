use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::config::ConnectionSettings;
use crate::diagnostics::{DiagnosticsSink, TracingSink};

use super::ConnectionManager;
use super::session::{Session, SharedSession, lock};

/// An explicitly passed connection context that several managers can share.
///
/// Managers built with `use_ambient_scope` redirect their handle, transaction
/// and keep-open flag to a scope while it is entered through
/// [`ConnectionManager::enter_scope`].
#[derive(Clone)]
pub struct ConnectionScope {
    pub(crate) session: SharedSession,
}

impl ConnectionScope {
    #[must_use]
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self::with_sink(settings, Arc::new(TracingSink))
    }

    #[must_use]
    pub fn with_sink(settings: &ConnectionSettings, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            session: Session::shared(settings, sink),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.session).is_open()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        lock(&self.session).in_transaction()
    }

    #[must_use]
    pub fn connection_string(&self) -> String {
        lock(&self.session).connection_string().to_string()
    }

    /// Whether both scopes share one native session.
    #[must_use]
    pub fn same_session(&self, other: &ConnectionScope) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("connection_string", &self.connection_string())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Redirects a manager to a scope until dropped, then restores the previous target.
pub struct ScopeGuard<'a> {
    manager: &'a mut ConnectionManager,
    previous: Option<ConnectionScope>,
}

impl<'a> ScopeGuard<'a> {
    pub(crate) fn enter(manager: &'a mut ConnectionManager, scope: &ConnectionScope) -> Self {
        let previous = manager.ambient.replace(scope.clone());
        Self { manager, previous }
    }
}

impl Deref for ScopeGuard<'_> {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.manager
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.manager.ambient = self.previous.take();
    }
}
