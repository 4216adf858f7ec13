//! Hemera: block-range sync and export pipeline for EVM chains.

mod aggregates;
mod api;
mod cli;
mod controller;
mod db;
mod error;
mod executor;
mod exporters;
mod jobs;
mod loader;
mod rpc;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, CommonArgs, JobArgs, Opts, ProviderArgs};
use controller::{
    create_recorder, default_recorder_spec, shutdown_channel, ExceptionRecorder, ReorgController, StreamController,
};
use db::DbPool;
use executor::BatchWorkExecutor;
use exporters::create_exporters;
use jobs::{build_registry, JobContext, JobScheduler};
use rpc::{Multicaller, RpcClient, RpcClientConfig};
use types::config::indexer::IndexerConfig;
use types::config::output::{parse_outputs, OutputTarget};
use types::entity::{required_output_types, EntityTypes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    match opts.command {
        Command::Stream(args) => {
            args.validate().map_err(anyhow::Error::msg)?;
            let mut config = IndexerConfig::load_or_default(args.common.config_file.as_deref())?;
            args.apply_to(&mut config);

            let setup = Pipeline::build(&config, &args.common, &args.provider, &args.jobs).await?;
            let recorder = setup.recorder(args.sync_recorder.as_deref())?;
            let mut controller = setup.into_controller(recorder, &config);
            controller
                .run(args.start_block, args.end_block, shutdown_channel())
                .await
                .context("stream failed")?;
        }
        Command::Reorg(args) => {
            let mut config = IndexerConfig::load_or_default(args.common.config_file.as_deref())?;
            args.provider.apply_to(&mut config);

            let setup = Pipeline::build(&config, &args.common, &args.provider, &args.jobs).await?;
            let range = ReorgController::command_range(args.block_number, args.ranges);
            let reorg = ReorgController::new(setup.pool.clone());
            let recorder = setup.recorder(args.sync_recorder.as_deref())?;
            reorg
                .handle_reorg(range, recorder.as_ref())
                .await
                .with_context(|| format!("failed to flag reorg {}", range))?;

            if args.resync {
                tracing::info!("Re-syncing {}", range);
                let mut controller = setup.into_controller(recorder, &config);
                controller
                    .run(Some(range.start), Some(range.end), shutdown_channel())
                    .await
                    .context("resync failed")?;
            }
        }
        Command::Load(args) => {
            let dir = args.source_dir().map_err(anyhow::Error::msg)?;
            let (_, required) = resolve_types(&args.jobs)?;
            let targets = parse_outputs(&args.jobs.output).map_err(anyhow::Error::msg)?;
            let pool = connect_for_outputs(&args.common, &targets).await?;
            let exporter = create_exporters(&targets, pool)?;
            let loaded = loader::load_dir(&dir, &required, &exporter).await?;
            tracing::info!("Loaded {} items from {}", loaded, dir.display());
        }
        Command::Api(args) => {
            let config = IndexerConfig::load_or_default(args.common.config_file.as_deref())?;
            let pool = require_pool(&args.common).await?;
            let state = api::ApiState::new(pool, &config.api, &config.native_token_symbol);
            let bind = args.bind_address.unwrap_or_else(|| config.api.bind_address.clone());
            api::serve(state, &bind, shutdown_channel()).await?;
        }
        Command::Aggregates(args) => {
            anyhow::ensure!(
                args.start_date < args.end_date,
                "start date {} must be before end date {}",
                args.start_date,
                args.end_date
            );
            let pool = require_pool(&args.common).await?;
            let executed = aggregates::run_aggregates(&pool, &args.template_dir, args.start_date, args.end_date)
                .await
                .context("aggregation failed")?;
            tracing::info!("Ran {} aggregation statements", executed);
        }
        Command::InitDb(common) => {
            require_pool(&common).await?;
        }
    }

    Ok(())
}

fn resolve_types(jobs: &JobArgs) -> anyhow::Result<(EntityTypes, std::collections::BTreeSet<types::items::ItemType>)> {
    let entity_types = EntityTypes::parse_list(&jobs.entity_types).map_err(anyhow::Error::msg)?;
    let required = required_output_types(entity_types, jobs.output_types.as_deref()).map_err(anyhow::Error::msg)?;
    anyhow::ensure!(!required.is_empty(), "no output types selected");
    Ok((entity_types, required))
}

async fn connect(url: &str, common: &CommonArgs) -> anyhow::Result<Arc<DbPool>> {
    let pool = DbPool::new(url, common.db_pool_size)
        .await
        .context("failed to connect to postgres")?;
    pool.run_migrations(Path::new(&common.migrations_dir))
        .await
        .context("failed to run migrations")?;
    Ok(Arc::new(pool))
}

async fn require_pool(common: &CommonArgs) -> anyhow::Result<Arc<DbPool>> {
    let url = common
        .postgres_url
        .as_deref()
        .context("--postgres-url (or POSTGRES_URL) is required")?;
    connect(url, common).await
}

/// Connect when an output or `--postgres-url` asks for Postgres.
async fn connect_for_outputs(common: &CommonArgs, targets: &[OutputTarget]) -> anyhow::Result<Option<Arc<DbPool>>> {
    let url = targets
        .iter()
        .find_map(|t| t.postgres_url().map(str::to_string))
        .or_else(|| common.postgres_url.clone());

    match url {
        Some(url) => Ok(Some(connect(&url, common).await?)),
        None if targets.iter().any(|t| t.is_postgres()) => {
            anyhow::bail!("postgres output configured without a connection URL")
        }
        None => Ok(None),
    }
}

/// Handles shared by `stream` and `reorg --resync`.
struct Pipeline {
    ctx: JobContext,
    scheduler: JobScheduler,
    exporter: exporters::CompositeExporter,
    pool: Option<Arc<DbPool>>,
    entity_types: EntityTypes,
}

impl Pipeline {
    async fn build(
        config: &IndexerConfig,
        common: &CommonArgs,
        provider: &ProviderArgs,
        jobs: &JobArgs,
    ) -> anyhow::Result<Self> {
        let (entity_types, required) = resolve_types(jobs)?;
        let targets = parse_outputs(&jobs.output).map_err(anyhow::Error::msg)?;

        let registry = build_registry();
        let scheduler = JobScheduler::new(&registry, required).context("cannot schedule jobs")?;

        let rpc = Arc::new(RpcClient::new(RpcClientConfig::from_settings(
            &provider.provider_uri,
            &config.rpc,
        )?)?);
        let debug_rpc = match &provider.debug_provider_uri {
            Some(uri) => Arc::new(RpcClient::new(RpcClientConfig::from_settings(uri, &config.rpc)?)?),
            None => rpc.clone(),
        };

        let chain_id = rpc.chain_id().await.context("failed to read chain id from provider")?;
        if let Some(expected) = config.chain_id {
            anyhow::ensure!(
                expected == chain_id,
                "configured chain id {} does not match provider chain id {}",
                expected,
                chain_id
            );
        }
        tracing::info!("Connected to chain {} (entity types: {})", chain_id, entity_types);

        let pool = connect_for_outputs(common, &targets).await?;
        let exporter = create_exporters(&targets, pool.clone())?;
        tracing::info!("Outputs: {}", exporter.names().join(", "));

        let ctx = JobContext {
            rpc: rpc.clone(),
            debug_rpc,
            executor: BatchWorkExecutor::from_settings(&config.rpc),
            multicaller: Arc::new(Multicaller::new(rpc, config.multicall.clone(), config.rpc.max_workers)),
            block_receipts_method: config.block_receipts_method.clone(),
        };

        Ok(Self {
            ctx,
            scheduler,
            exporter,
            pool,
            entity_types,
        })
    }

    fn recorder(&self, spec: Option<&str>) -> anyhow::Result<Box<dyn controller::SyncRecorder>> {
        let spec = spec
            .map(str::to_string)
            .unwrap_or_else(|| default_recorder_spec(self.pool.is_some()));
        Ok(create_recorder(&spec, self.entity_types, self.pool.clone())?)
    }

    fn into_controller(self, recorder: Box<dyn controller::SyncRecorder>, config: &IndexerConfig) -> StreamController {
        StreamController::new(
            self.ctx,
            self.scheduler,
            self.exporter,
            recorder,
            ReorgController::new(self.pool.clone()),
            ExceptionRecorder::new(self.pool),
            config.stream.clone(),
        )
    }
}
