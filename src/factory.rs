//! Database factories.
//!
//! [`DatabaseProviderFactory`] builds [`Database`] instances from a
//! [`DataConfiguration`]. [`DatabaseFactory`] is the process-wide entry point:
//! install creation functions (or a provider factory) once at startup, then
//! resolve databases from anywhere.

use crate::config::DataConfiguration;
use crate::db::Database;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionString;
use crate::provider::ProviderRegistry;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Builds databases from configuration.
#[derive(Debug, Clone)]
pub struct DatabaseProviderFactory {
    config: DataConfiguration,
    registry: ProviderRegistry,
}

impl DatabaseProviderFactory {
    pub fn new(config: DataConfiguration) -> DbResult<Self> {
        config.validate()?;
        let registry = ProviderRegistry::with_mappings(&config.data_configuration.provider_mappings)?;
        Ok(Self { config, registry })
    }

    pub fn from_json(json: &str) -> DbResult<Self> {
        Self::new(DataConfiguration::from_json(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::new(DataConfiguration::from_file(path)?)
    }

    pub fn configuration(&self) -> &DataConfiguration {
        &self.config
    }

    /// The database named as default in configuration.
    pub fn create_default(&self) -> DbResult<Arc<Database>> {
        let name = self
            .config
            .data_configuration
            .default_database
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| DbError::configuration("no default database is configured"))?;
        self.create(name)
    }

    /// The database for a named connection string.
    pub fn create(&self, name: &str) -> DbResult<Arc<Database>> {
        if name.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "name",
                "database name must not be empty",
            ));
        }

        let settings = self.config.connection_string(name).ok_or_else(|| {
            DbError::configuration(format!("connection string '{}' is not configured", name))
        })?;
        let provider_name = settings.provider_name_or_default();
        let (kind, capabilities) = self.registry.resolve(provider_name)?;
        let connection_string = ConnectionString::parse(&settings.connection_string)?;

        info!(
            database = %settings.name,
            provider = %provider_name,
            kind = %kind,
            connection = %connection_string.without_credentials(),
            "Creating database"
        );

        let database = Database::new(
            settings.name.clone(),
            provider_name,
            kind,
            capabilities,
            connection_string,
        )
        .with_oracle_packages(self.config.oracle_packages(name).to_vec())
        .with_command_timeout(self.config.command_timeout());

        Ok(Arc::new(database))
    }
}

// =============================================================================
// Process-wide factory
// =============================================================================

type CreateDefault = Arc<dyn Fn() -> DbResult<Arc<Database>> + Send + Sync>;
type CreateNamed = Arc<dyn Fn(&str) -> DbResult<Arc<Database>> + Send + Sync>;

#[derive(Clone)]
struct Installed {
    create_default: CreateDefault,
    create_named: CreateNamed,
}

static FACTORY: RwLock<Option<Installed>> = RwLock::new(None);

/// The process-wide database factory.
///
/// Reads run concurrently; installing and clearing take the write lock.
pub struct DatabaseFactory;

impl DatabaseFactory {
    /// Install the creation functions. With `throw_if_set`, fails if a
    /// factory is already installed; otherwise replaces it.
    pub fn set_databases<D, N>(create_default: D, create_named: N, throw_if_set: bool) -> DbResult<()>
    where
        D: Fn() -> DbResult<Arc<Database>> + Send + Sync + 'static,
        N: Fn(&str) -> DbResult<Arc<Database>> + Send + Sync + 'static,
    {
        let mut slot = FACTORY.write().unwrap_or_else(|e| e.into_inner());
        if throw_if_set && slot.is_some() {
            return Err(DbError::FactoryAlreadySet);
        }
        *slot = Some(Installed {
            create_default: Arc::new(create_default),
            create_named: Arc::new(create_named),
        });
        debug!("Database factory installed");
        Ok(())
    }

    /// Install a configuration-backed provider factory.
    pub fn set_provider_factory(factory: DatabaseProviderFactory, throw_if_set: bool) -> DbResult<()> {
        let factory = Arc::new(factory);
        let named = Arc::clone(&factory);
        Self::set_databases(
            move || factory.create_default(),
            move |name| named.create(name),
            throw_if_set,
        )
    }

    /// Remove the installed factory.
    pub fn clear() {
        *FACTORY.write().unwrap_or_else(|e| e.into_inner()) = None;
        debug!("Database factory cleared");
    }

    pub fn is_set() -> bool {
        FACTORY
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn create_database() -> DbResult<Arc<Database>> {
        let installed = Self::installed()?;
        (installed.create_default)()
    }

    pub fn create_named_database(name: &str) -> DbResult<Arc<Database>> {
        let installed = Self::installed()?;
        (installed.create_named)(name)
    }

    // The functions run outside the lock so they may use the factory themselves.
    fn installed() -> DbResult<Installed> {
        FACTORY
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DbError::FactoryNotSet)
    }
}
