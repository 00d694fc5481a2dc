//! Registry of database instances keyed by app and URL.

use super::instance::Database;
use crate::app::{App, AppId};
use crate::callbacks::CallbackRegistry;
use crate::error::{BridgeError, Result};
use crate::router::{EventRouter, RouterConfig};
use crate::service::Connector;
use crate::types::InstanceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry configuration.
#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    /// Configuration of the router shared by every instance.
    pub router: RouterConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InstanceKey {
    app: AppId,
    url: String,
}

pub(crate) struct RegistryInner {
    connector: Arc<dyn Connector>,
    callbacks: Arc<CallbackRegistry>,
    router: Arc<EventRouter>,
    instances: Mutex<HashMap<InstanceKey, Arc<Database>>>,
    default_app: Mutex<Option<Arc<App>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    /// Forget the instance with `id`, if it is still the registered one.
    pub(crate) fn remove(&self, id: InstanceId) {
        let removed: Vec<Arc<Database>> = {
            let mut instances = self.instances.lock();
            let keys: Vec<InstanceKey> = instances
                .iter()
                .filter(|(_, db)| db.id() == id)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| instances.remove(key)).collect()
        };
        // Dropped outside the lock.
        drop(removed);
    }
}

/// Hands out one [`Database`] per (app, URL).
///
/// All instances share one [`CallbackRegistry`] and one [`EventRouter`];
/// the router is given to the connector so native callbacks find their way
/// back.
#[derive(Clone)]
pub struct DatabaseRegistry {
    inner: Arc<RegistryInner>,
}

impl DatabaseRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, RegistryConfig::default())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: RegistryConfig) -> Self {
        let callbacks = Arc::new(CallbackRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&callbacks), config.router));
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                callbacks,
                router,
                instances: Mutex::new(HashMap::new()),
                default_app: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    /// App used by [`any_instance`](Self::any_instance) when nothing is registered.
    pub fn set_default_app(&self, app: Arc<App>) {
        *self.inner.default_app.lock() = Some(app);
    }

    /// The instance for `app` and `url`, created on first request.
    ///
    /// Without `url` the app's configured database URL is used. A missing,
    /// empty or malformed URL is a configuration error.
    pub fn get_instance(&self, app: &Arc<App>, url: Option<&str>) -> Result<Arc<Database>> {
        if app.is_disposed() {
            return Err(BridgeError::Configuration(format!(
                "app {} has been disposed",
                app.name()
            )));
        }
        let url = resolve_url(app, url)?;
        let key = InstanceKey {
            app: app.id(),
            url: url.clone(),
        };

        let database = {
            let mut instances = self.inner.instances.lock();
            if let Some(existing) = instances.get(&key) {
                return Ok(Arc::clone(existing));
            }

            let service =
                self.inner
                    .connector
                    .connect(app, &url, Arc::clone(&self.inner.router))?;
            let id = InstanceId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            let database = Database::new(
                id,
                Arc::clone(app),
                url,
                service,
                Arc::clone(&self.inner.callbacks),
                Arc::downgrade(&self.inner),
            );
            instances.insert(key, Arc::clone(&database));
            database
        };

        database.install_dispose_hook();
        debug!(
            app = %app.name(),
            url = %database.url(),
            id = ?database.id(),
            "created database instance"
        );
        Ok(database)
    }

    /// The instance for the app's configured URL.
    pub fn get_default_instance(&self, app: &Arc<App>) -> Result<Arc<Database>> {
        self.get_instance(app, None)
    }

    /// Some registered instance, or the default app's instance if none is.
    ///
    /// Only for process-wide toggles that are not tied to one instance.
    pub fn any_instance(&self) -> Result<Arc<Database>> {
        if let Some(existing) = self.inner.instances.lock().values().next() {
            return Ok(Arc::clone(existing));
        }
        let app = self.inner.default_app.lock().clone().ok_or_else(|| {
            BridgeError::Configuration("no database instance and no default app".to_string())
        })?;
        self.get_default_instance(&app)
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    pub fn go_online(&self) -> Result<()> {
        self.any_instance()?.go_online()
    }

    pub fn go_offline(&self) -> Result<()> {
        self.any_instance()?.go_offline()
    }
}

fn resolve_url(app: &App, url: Option<&str>) -> Result<String> {
    let url = url
        .or(app.options().database_url.as_deref())
        .map(str::trim)
        .unwrap_or_default();

    if url.is_empty() {
        return Err(BridgeError::Configuration(format!(
            "no database URL configured for app {}",
            app.name()
        )));
    }
    if !url.contains("://") {
        return Err(BridgeError::Configuration(format!(
            "database URL {:?} is not an absolute URL",
            url
        )));
    }
    Ok(url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppOptions;

    #[test]
    fn test_resolve_url() {
        let app = App::new(
            "resolve",
            AppOptions {
                database_url: Some("https://demo.example.com/".to_string()),
            },
        );
        assert_eq!(resolve_url(&app, None).unwrap(), "https://demo.example.com");
        assert_eq!(
            resolve_url(&app, Some("https://other.example.com")).unwrap(),
            "https://other.example.com"
        );
        assert!(matches!(
            resolve_url(&app, Some("  ")),
            Err(BridgeError::Configuration(_))
        ));
        assert!(resolve_url(&app, Some("demo.example.com")).is_err());

        let bare = App::new("bare", AppOptions::default());
        assert!(resolve_url(&bare, None).is_err());
    }
}
