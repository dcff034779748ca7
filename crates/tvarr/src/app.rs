//! Composition root: wires the store, services, scheduler, runner and
//! relay together and drives graceful start/stop.

use std::net::SocketAddr;
use std::sync::Arc;

use sandbox_fs::SandboxRoot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::database::repositories::{
    ChannelRepository, EpgProgramRepository, EpgSourceRepository, JobRepository, RuleRepository,
    StreamProxyRepository, StreamSourceRepository,
};
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::expression::RuleCache;
use crate::pipeline::GenerationPipeline;
use crate::progress::ProgressBus;
use crate::relay::{ClientClassifier, LocalFfmpegTranscoder, RelayManager, StreamProber};
use crate::scheduling::handlers::{
    BackupHandler, EpgIngestionHandler, LogoCleanupHandler, ProxyGenerationHandler,
    StreamIngestionHandler,
};
use crate::scheduling::{CronScheduler, JobExecutor, JobRunner};
use crate::services::LogoCacheService;
use crate::sources::SourceHandlerFactory;
use crate::utils::{
    CircuitBreakerConfig, CircuitBreakerManager, CredentialVault, HttpClientConfig,
    UpstreamHttpClient,
};
use crate::web::{self, StreamState};

pub struct App {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pub relay: Arc<RelayManager>,
    pub progress: Arc<ProgressBus>,
}

impl App {
    /// Build every subsystem and start the background services.
    pub async fn start(config: Config) -> AppResult<Self> {
        let cancel = CancellationToken::new();

        let database = Database::connect(&config.database).await?;
        let connection = database.connection();
        let vault = CredentialVault::new(&config.database.app_secret);

        let stream_sources = StreamSourceRepository::new(connection.clone(), vault.clone());
        let epg_sources = EpgSourceRepository::new(connection.clone(), vault.clone());
        let channels = ChannelRepository::new(connection.clone());
        let programs = EpgProgramRepository::new(connection.clone());
        let proxies = StreamProxyRepository::new(connection.clone());
        let rules = RuleRepository::new(connection.clone());
        let jobs = JobRepository::new(connection.clone());

        let sandbox = SandboxRoot::open(&config.storage.data_dir).await?;
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default()));
        let http = UpstreamHttpClient::new(
            HttpClientConfig {
                connect_timeout: config.ingestion.connect_timeout,
                request_timeout: config.ingestion.request_timeout,
                max_retries: config.ingestion.max_retries,
                retry_backoff: config.ingestion.retry_backoff,
                max_body_bytes: config.ingestion.max_body_bytes,
                ..HttpClientConfig::default()
            },
            breakers.clone(),
        )?;

        let progress = ProgressBus::new();
        let rule_cache = Arc::new(RuleCache::default());
        let logos = Arc::new(LogoCacheService::new(
            sandbox.clone(),
            http.clone(),
            config.pipeline.logo_concurrency,
        ));
        let factory = Arc::new(SourceHandlerFactory::new(
            http.clone(),
            channels.clone(),
            programs.clone(),
            config.ingestion.batch_size,
        ));
        let pipeline = Arc::new(GenerationPipeline::standard(
            &config.pipeline,
            progress.clone(),
            channels.clone(),
            programs.clone(),
            rules.clone(),
            rule_cache.clone(),
            logos.clone(),
            sandbox.clone(),
        ));

        let mut executor = JobExecutor::new();
        executor.register(Arc::new(StreamIngestionHandler {
            sources: stream_sources.clone(),
            proxies: proxies.clone(),
            jobs: jobs.clone(),
            factory: factory.clone(),
            progress: progress.clone(),
            config: config.scheduler.clone(),
        }));
        executor.register(Arc::new(EpgIngestionHandler {
            sources: epg_sources.clone(),
            proxies: proxies.clone(),
            jobs: jobs.clone(),
            factory,
            progress: progress.clone(),
            config: config.scheduler.clone(),
        }));
        executor.register(Arc::new(ProxyGenerationHandler {
            proxies: proxies.clone(),
            stream_sources: stream_sources.clone(),
            epg_sources: epg_sources.clone(),
            pipeline,
            progress: progress.clone(),
            base_url: config.server.base_url.clone(),
        }));
        executor.register(Arc::new(LogoCleanupHandler {
            logos,
            channels: channels.clone(),
            jobs: jobs.clone(),
            history_retention: config.storage.job_history_retention,
        }));
        executor.register(Arc::new(BackupHandler {
            database: config.database.clone(),
            sandbox,
            channels: channels.clone(),
            programs,
            retention: config.storage.backup_retention,
        }));
        let executor = Arc::new(executor);

        let scheduler = CronScheduler::new(
            stream_sources,
            epg_sources,
            jobs.clone(),
            config.scheduler.clone(),
        );
        let runner = Arc::new(JobRunner::new(jobs, executor, config.scheduler.clone()));

        let prober = Arc::new(StreamProber::new(
            config.relay.ffprobe_path.clone(),
            config.relay.probe_timeout,
        ));
        let transcoder = Arc::new(LocalFfmpegTranscoder::new(config.relay.ffmpeg_path.clone()));
        let relay = RelayManager::new(prober, transcoder, http.clone(), config.relay.clone());
        let classifier = Arc::new(ClientClassifier::from_config(&config.relay.client_rules)?);

        let stream_state = Arc::new(StreamState {
            channels,
            proxies,
            relay: relay.clone(),
            classifier,
            http,
        });

        let mut tasks = Vec::new();

        let scheduler_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(scheduler_cancel).await {
                error!(error = %e, "scheduler exited with error");
            }
        }));

        let runner_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(runner_cancel).await {
                error!(error = %e, "job runner exited with error");
            }
        }));

        let reaper_relay = relay.clone();
        let reaper_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            reaper_relay.run_reaper(reaper_cancel).await;
        }));

        let bind: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
            .parse()
            .map_err(|e| AppError::validation(format!("invalid bind address: {e}")))?;
        let router = web::stream_router(stream_state);
        let server_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, address = %bind, "failed to bind stream listener");
                    return;
                }
            };
            info!(address = %bind, "stream endpoints listening");
            let serve = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { server_cancel.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "stream server exited with error");
            }
        }));

        info!(version = env!("CARGO_PKG_VERSION"), "tvarr started");
        Ok(Self {
            cancel,
            tasks,
            relay,
            progress,
        })
    }

    /// Cooperative shutdown: cancel everything, then wait for the
    /// background tasks to drain.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("shutdown complete");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
