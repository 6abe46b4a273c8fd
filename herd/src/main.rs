use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use herd::cli::{Cli, Commands};
use herd::config;
use herd::store::schema;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command() {
        Commands::Configcheck => {
            config::load(&cli.config)?;
            println!("configuration OK");
            Ok(())
        }

        Commands::Schema => {
            for (name, ddl) in schema::create_order() {
                println!("-- {}\n{};\n", name, ddl);
            }
            Ok(())
        }

        Commands::Run => {
            let config = config::load(&cli.config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.general.workers.max(2))
                .enable_all()
                .build()?;

            runtime.block_on(run(config))?;
            Ok(())
        }
    }
}

#[cfg(feature = "mysql")]
async fn run(config: std::sync::Arc<herd_config::Config>) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;

    use herd::pool::{Pools, PoolSettings};
    use herd::replication::driver::SqlDriver;
    use herd::store::driver::MySqlConnector;
    use herd::store::{SqlCatalog, Store, StoreTarget};
    use herd::Engine;

    let connector: Arc<dyn herd::sql::Connector> = Arc::new(MySqlConnector::default());

    let store = Store::new(connector.clone(), StoreTarget::from_config(&config.store));

    // The state store is authoritative; nothing is replayed on start, but
    // the metadata tables must exist.
    let mut txn = store.begin().await?;
    for (_, ddl) in schema::create_order() {
        txn.exec(ddl, &[]).await?;
    }
    txn.commit().await?;

    let pools = Pools::new(connector.clone(), PoolSettings::from_config(&config.general));
    let driver = Arc::new(SqlDriver::new(
        pools.clone(),
        connector.clone(),
        config.provision.clone(),
        config.general.connect_timeout_duration(),
    ));
    let catalog = Arc::new(SqlCatalog::new(store));

    let engine = Engine::new(config, catalog, driver, pools);
    info!("herd is up; state store is authoritative");

    tokio::signal::ctrl_c().await?;
    info!("shutting down, draining in-flight steps");
    engine.shutdown().await;

    Ok(())
}

#[cfg(not(feature = "mysql"))]
async fn run(_config: std::sync::Arc<herd_config::Config>) -> Result<(), Box<dyn std::error::Error>> {
    Err("herd was built without the `mysql` feature; no state store driver is available".into())
}
