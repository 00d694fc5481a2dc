//! A single database instance.

use super::registry::RegistryInner;
use crate::app::{App, HookId};
use crate::callbacks::CallbackRegistry;
use crate::deferred::{self, Deferred};
use crate::error::{BridgeError, Result};
use crate::query::DatabaseReference;
use crate::service::{Completion, SyncService};
use crate::types::{DatabasePath, InstanceId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Wrapper around one native database connection.
pub struct Database {
    id: InstanceId,
    app: Arc<App>,
    url: String,
    service: Arc<dyn SyncService>,
    callbacks: Arc<CallbackRegistry>,
    registry: Weak<RegistryInner>,
    dispose_hook: Mutex<Option<HookId>>,
    disposed: AtomicBool,
}

impl Database {
    pub(crate) fn new(
        id: InstanceId,
        app: Arc<App>,
        url: String,
        service: Arc<dyn SyncService>,
        callbacks: Arc<CallbackRegistry>,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            app,
            url,
            service,
            callbacks,
            registry,
            dispose_hook: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Dispose this instance when its app is disposed.
    ///
    /// Must not be called with the registry lock held: the hook runs
    /// immediately if the app is already gone.
    pub(crate) fn install_dispose_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let hook = self.app.on_dispose(move || {
            if let Some(database) = weak.upgrade() {
                database.dispose();
            }
        });
        let mut slot = self.dispose_hook.lock();
        if self.is_disposed() {
            self.app.remove_dispose_hook(hook);
        } else {
            *slot = Some(hook);
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub(crate) fn service(&self) -> &Arc<dyn SyncService> {
        &self.service
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        Ok(())
    }

    /// Reference to the root of the database.
    pub fn root_reference(self: &Arc<Self>) -> Result<DatabaseReference> {
        self.ensure_active()?;
        Ok(DatabaseReference::new(Arc::clone(self), DatabasePath::root()))
    }

    /// Reference to `path`, which may contain slashes.
    pub fn reference(self: &Arc<Self>, path: &str) -> Result<DatabaseReference> {
        self.ensure_active()?;
        let path = DatabasePath::parse(path)?;
        Ok(DatabaseReference::new(Arc::clone(self), path))
    }

    pub fn go_online(&self) -> Result<()> {
        self.ensure_active()?;
        self.service.go_online();
        Ok(())
    }

    pub fn go_offline(&self) -> Result<()> {
        self.ensure_active()?;
        self.service.go_offline();
        Ok(())
    }

    /// Listener aggregates currently attached through this instance.
    pub fn active_listeners(&self) -> usize {
        self.callbacks.for_instance(self.id).len()
    }

    /// Number of live handles keeping this instance alive.
    pub fn strong_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Start a native operation whose result arrives on a service thread.
    ///
    /// The completion holds a strong reference to the instance until it fires.
    pub(crate) fn run_operation<T, F>(self: &Arc<Self>, op: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SyncService, Completion<T>),
    {
        let (completer, deferred) = deferred::channel();
        if let Err(e) = self.ensure_active() {
            completer.complete(Err(e));
            return deferred;
        }

        let keep_alive = Arc::clone(self);
        op(
            self.service.as_ref(),
            Box::new(move |result| {
                completer.complete(result.map_err(BridgeError::from));
                drop(keep_alive);
            }),
        );
        deferred
    }

    /// Tear the instance down: drop it from the registry, detach every
    /// listener created through it and release the native connection.
    ///
    /// Idempotent. Handles that outlive disposal fail with
    /// [`BridgeError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        if let Some(hook) = self.dispose_hook.lock().take() {
            self.app.remove_dispose_hook(hook);
        }

        let detached: usize = self
            .callbacks
            .for_instance(self.id)
            .iter()
            .map(|aggregate| aggregate.detach_all())
            .sum();

        self.service.shutdown();
        debug!(
            app = %self.app.name(),
            url = %self.url,
            detached,
            "disposed database instance"
        );
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.service.shutdown();
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("app", &self.app.name())
            .field("url", &self.url)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
