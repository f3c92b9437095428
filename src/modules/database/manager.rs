use crate::modules::context::Initialize;
use crate::modules::database::{META_MODELS, TASK_MODELS};
use crate::modules::error::{code::ErrorCode, MailVaultError, MailVaultResult};
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::raise_error;
use native_db::{Builder, Database};
use std::sync::{Arc, LazyLock};
use tracing::info;

pub static DB_MANAGER: LazyLock<DatabaseManager> = LazyLock::new(DatabaseManager::new);

pub struct DatabaseManager {
    /// Metadata and archive database instance
    meta_db: Arc<Database<'static>>,
    /// Routine scheduling database instance
    tasks_db: Arc<Database<'static>>,
}

impl DatabaseManager {
    #[cfg(test)]
    fn new() -> Self {
        DatabaseManager {
            meta_db: Arc::new(Builder::new().create_in_memory(&META_MODELS).unwrap()),
            tasks_db: Arc::new(Builder::new().create_in_memory(&TASK_MODELS).unwrap()),
        }
    }

    #[cfg(not(test))]
    fn new() -> Self {
        let meta_db = Self::init_meta_database().expect("Failed to initialize metadata database");
        let tasks_db = Self::init_task_database().expect("Failed to initialize tasks database");
        DatabaseManager { meta_db, tasks_db }
    }

    /// Get a reference to the metadata/archive database
    pub fn meta_db(&self) -> &Arc<Database<'static>> {
        &self.meta_db
    }

    /// Get a reference to the routine scheduling database
    pub fn tasks_db(&self) -> &Arc<Database<'static>> {
        &self.tasks_db
    }

    #[cfg(not(test))]
    fn init_meta_database() -> MailVaultResult<Arc<Database<'static>>> {
        info!(
            "Initializing metadata database at: {:?}",
            &DATA_DIR_MANAGER.meta_db
        );
        let mut database = Builder::new()
            .create(&META_MODELS, DATA_DIR_MANAGER.meta_db.clone())
            .map_err(Self::handle_database_error)?;
        database
            .compact()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        Ok(Arc::new(database))
    }

    #[cfg(not(test))]
    fn init_task_database() -> MailVaultResult<Arc<Database<'static>>> {
        info!(
            "Initializing task database at: {:?}",
            &DATA_DIR_MANAGER.task_db
        );
        let mut database = Builder::new()
            .create(&TASK_MODELS, DATA_DIR_MANAGER.task_db.clone())
            .map_err(Self::handle_database_error)?;
        database
            .compact()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        Ok(Arc::new(database))
    }

    #[allow(dead_code)]
    fn handle_database_error(error: native_db::db_type::Error) -> MailVaultError {
        match error {
            native_db::db_type::Error::RedbDatabaseError(database_error) => match database_error {
                redb::DatabaseError::DatabaseAlreadyOpen => {
                    raise_error!(
                        "Database is already open by another instance".into(),
                        ErrorCode::InternalError
                    )
                }
                other => {
                    raise_error!(
                        format!("Database error: {:?}", other),
                        ErrorCode::InternalError
                    )
                }
            },
            other => {
                raise_error!(
                    format!("Failed to create database: {:?}", other),
                    ErrorCode::InternalError
                )
            }
        }
    }
}

impl Initialize for DatabaseManager {
    async fn initialize() -> MailVaultResult<()> {
        // Databases open lazily on first access; touching the manager here
        // surfaces open errors during startup rather than mid-cycle.
        let _ = DB_MANAGER.meta_db();
        let _ = DB_MANAGER.tasks_db();
        Ok(())
    }
}
