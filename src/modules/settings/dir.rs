use crate::modules::context::Initialize;
use crate::modules::settings::cli::SETTINGS;
use crate::{
    modules::error::{code::ErrorCode, MailVaultResult},
    raise_error,
};
use std::path::PathBuf;
use std::sync::LazyLock;

pub const META_FILE: &str = "meta.db";
pub const TASK_FILE: &str = "tasks.db";
const BLOB_DIR: &str = "blobs";
const LOG_DIR: &str = "logs";
const ROUTINE_LOG_DIR: &str = "routines";

pub static DATA_DIR_MANAGER: LazyLock<DataDirManager> =
    LazyLock::new(|| DataDirManager::new(PathBuf::from(&SETTINGS.mailvault_root_dir)));

#[derive(Debug)]
pub struct DataDirManager {
    pub root_dir: PathBuf,
    pub meta_db: PathBuf,
    pub task_db: PathBuf,
    pub blob_dir: PathBuf,
    pub log_dir: PathBuf,
    pub routine_log_dir: PathBuf,
}

impl Initialize for DataDirManager {
    async fn initialize() -> MailVaultResult<()> {
        for dir in [
            &DATA_DIR_MANAGER.root_dir,
            &DATA_DIR_MANAGER.blob_dir,
            &DATA_DIR_MANAGER.log_dir,
            &DATA_DIR_MANAGER.routine_log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        }
        Ok(())
    }
}

impl DataDirManager {
    pub fn new(root_dir: PathBuf) -> Self {
        let log_dir = root_dir.join(LOG_DIR);
        Self {
            meta_db: root_dir.join(META_FILE),
            task_db: root_dir.join(TASK_FILE),
            blob_dir: root_dir.join(BLOB_DIR),
            routine_log_dir: log_dir.join(ROUTINE_LOG_DIR),
            log_dir,
            root_dir,
        }
    }

    /// Log file of one fetching routine, named by its uuid.
    pub fn routine_log_file(&self, routine_uuid: &str) -> PathBuf {
        self.routine_log_dir.join(format!("{}.log", routine_uuid))
    }
}
