use mimalloc::MiMalloc;
use modules::{
    common::signal::SignalManager,
    context::Initialize,
    database::manager::DatabaseManager,
    error::MailVaultResult,
    logger,
    scheduler::RoutineScheduler,
    settings::{cli::SETTINGS, dir::DataDirManager},
};
use tracing::info;

mod modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static LOGO: &str = r#"
  __  __       _ ___     __          _ _
 |  \/  | __ _(_) | \ \ / /_ _ _   _| | |_
 | |\/| |/ _` | | |  \ V / _` | | | | | __|
 | |  | | (_| | | | | | | (_| | |_| | | |_
 |_|  |_|\__,_|_|_| |_| \__,_|\__,_|_|\__|

"#;

#[tokio::main]
async fn main() -> MailVaultResult<()> {
    logger::initialize_logging();
    info!("{}", LOGO);
    info!("Starting mailvault-server");
    info!("Version:  {}", mailvault_version!());

    if let Err(error) = initialize().await {
        eprintln!("{:?}", error);
        return Err(error);
    }

    // Workers run until a shutdown signal arrives, then are joined with a
    // bounded timeout so an in-flight archive cycle can finish cleanly.
    RoutineScheduler::get().run_until_shutdown().await;
    info!("mailvault-server stopped");
    Ok(())
}

/// Initialize the system by validating settings and starting necessary tasks.
async fn initialize() -> MailVaultResult<()> {
    SETTINGS.validate()?;
    SignalManager::initialize().await?;
    DataDirManager::initialize().await?;
    DatabaseManager::initialize().await?;
    RoutineScheduler::initialize().await?;
    Ok(())
}
