//! Application identity and disposal hooks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Name used when none is given.
pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";

/// Application options.
#[derive(Clone, Debug, Default)]
pub struct AppOptions {
    /// Database used when `get_instance` is called without a URL.
    pub database_url: Option<String>,
}

/// Identity of an [`App`] object. Two apps with the same name differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AppId(u64);

static NEXT_APP_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a registered disposal hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type DisposeHook = Box<dyn FnOnce() + Send>;

/// An application: the owner database instances are created for.
///
/// Disposing the app runs its hooks once; the instance registry uses this to
/// dispose every database created for the app.
pub struct App {
    id: AppId,
    name: String,
    options: AppOptions,
    hooks: Mutex<Vec<(HookId, DisposeHook)>>,
    next_hook: AtomicU64,
    disposed: AtomicBool,
}

impl App {
    pub fn new(name: impl Into<String>, options: AppOptions) -> Arc<Self> {
        Arc::new(Self {
            id: AppId(NEXT_APP_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            options,
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    /// App named [`DEFAULT_APP_NAME`].
    pub fn with_defaults(options: AppOptions) -> Arc<Self> {
        Self::new(DEFAULT_APP_NAME, options)
    }

    pub fn id(&self) -> AppId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run `hook` when the app is disposed. Runs immediately if it already was.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) -> HookId {
        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        {
            let mut hooks = self.hooks.lock();
            if !self.is_disposed() {
                hooks.push((id, Box::new(hook)));
                return id;
            }
        }
        hook();
        id
    }

    /// Forget a hook. Returns false if it already ran or never existed.
    pub fn remove_dispose_hook(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    /// Dispose the app. Idempotent.
    pub fn dispose(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        debug!(app = %self.name, hooks = hooks.len(), "disposing app");
        // Hooks may call back into the app, so run them unlocked.
        for (_, hook) in hooks {
            hook();
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
