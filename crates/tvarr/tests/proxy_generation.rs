//! End-to-end generation: ingest fixtures into an in-memory store, run
//! the full stage sequence, and check the published artifacts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sandbox_fs::SandboxRoot;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use tvarr::config::{DatabaseConfig, PipelineConfig};
use tvarr::database::repositories::{
    ChannelRepository, EpgProgramRepository, NewChannel, NewEpgProgram, RuleRepository,
    StreamProxyRepository, StreamSourceCreate, StreamSourceRepository, StreamProxyCreate,
};
use tvarr::database::Database;
use tvarr::expression::RuleCache;
use tvarr::models::{
    FilterAction, NumberingMode, ProxyMode, ProxySourceRef, RuleDomain, StreamSourceKind,
};
use tvarr::pipeline::{EpgBinding, GenerationPipeline, PipelineContext, SourceBinding};
use tvarr::progress::ProgressBus;
use tvarr::services::LogoCacheService;
use tvarr::sources::m3u::parse_playlist;
use tvarr::sources::xmltv::parse_guide;
use tvarr::utils::{
    CircuitBreakerConfig, CircuitBreakerManager, CredentialVault, HttpClientConfig,
    UpstreamHttpClient,
};

struct Fixture {
    _database: Database,
    channels: ChannelRepository,
    programs: EpgProgramRepository,
    rules: RuleRepository,
    proxies: StreamProxyRepository,
    stream_sources: StreamSourceRepository,
    sandbox: SandboxRoot,
    pipeline: GenerationPipeline,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let database = Database::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        app_secret: "test".to_string(),
    })
    .await
    .expect("in-memory database");
    let connection = database.connection();

    let dir = tempfile::tempdir().unwrap();
    let sandbox = SandboxRoot::open(dir.path()).await.unwrap();

    let channels = ChannelRepository::new(connection.clone());
    let programs = EpgProgramRepository::new(connection.clone());
    let rules = RuleRepository::new(connection.clone());
    let proxies = StreamProxyRepository::new(connection.clone());
    let vault = CredentialVault::new("test");
    let stream_sources = StreamSourceRepository::new(connection.clone(), vault);

    let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default()));
    let http = UpstreamHttpClient::new(HttpClientConfig::default(), breakers).unwrap();
    let logos = Arc::new(LogoCacheService::new(sandbox.clone(), http, 2));

    let pipeline_config = PipelineConfig {
        // No live ingestions in tests; skip the guard wait.
        ingestion_guard: false,
        ingestion_guard_timeout: Duration::from_secs(1),
        logo_concurrency: 2,
    };
    let pipeline = GenerationPipeline::standard(
        &pipeline_config,
        ProgressBus::new(),
        channels.clone(),
        programs.clone(),
        rules.clone(),
        Arc::new(RuleCache::default()),
        logos,
        sandbox.clone(),
    );

    Fixture {
        _database: database,
        channels,
        programs,
        rules,
        proxies,
        stream_sources,
        sandbox,
        pipeline,
        _dir: dir,
    }
}

fn channel(name: &str, group: &str, tvg_id: &str) -> NewChannel {
    NewChannel {
        external_id: None,
        tvg_id: Some(tvg_id.to_string()),
        tvg_name: Some(name.to_string()),
        tvg_logo: None,
        group_title: Some(group.to_string()),
        channel_name: name.to_string(),
        channel_number: None,
        stream_url: format!("http://up/{tvg_id}.ts"),
        stream_type: None,
        language: None,
        country: None,
        is_adult: false,
    }
}

fn program(channel_id: &str, title: &str, offset_hours: i64) -> NewEpgProgram {
    let start = Utc::now() + chrono::Duration::hours(offset_hours);
    NewEpgProgram {
        channel_id: channel_id.to_string(),
        title: title.to_string(),
        description: None,
        category: None,
        start,
        stop: start + chrono::Duration::hours(1),
        icon: None,
        rating: None,
        is_new: false,
        is_premiere: false,
        is_live: false,
    }
}

/// Bulk ingestion + filter + mapping + sequential numbering + render.
#[tokio::test]
async fn generation_applies_rules_and_publishes_both_artifacts() {
    let fx = fixture().await;

    let source = fx
        .stream_sources
        .create(StreamSourceCreate {
            name: "provider-a".to_string(),
            kind: StreamSourceKind::M3u,
            url: "http://up/playlist.m3u".to_string(),
            username: None,
            password: None,
            is_active: true,
            priority: 1,
            update_cron: String::new(),
        })
        .await
        .unwrap();

    fx.channels
        .replace_for_source(
            source.id,
            vec![
                channel("HBO", "Movies", "hbo.us"),
                channel("BBC News", "News", "bbc.uk"),
                channel("Adult XXX", "Adult", "xxx.tv"),
            ],
            100,
        )
        .await
        .unwrap();

    // EPG source id is only used as the owner key here.
    let epg_owner = Ulid::new();
    fx.programs
        .replace_for_source(
            epg_owner,
            vec![
                program("hbo.us", "Movie Night", 1),
                program("bbc.uk", "News at Ten", 2),
                program("xxx.tv", "Late Show", 3),
            ],
            100,
        )
        .await
        .unwrap();

    fx.rules
        .create_filter(
            "drop-adult".to_string(),
            None,
            RuleDomain::Stream,
            "group_title equals \"Adult\"".to_string(),
            FilterAction::Exclude,
            1,
            true,
        )
        .await
        .unwrap();
    fx.rules
        .create_mapping(
            "uk-prefix".to_string(),
            None,
            RuleDomain::Stream,
            "group_title equals \"News\" => channel_name PREPEND \"UK: \"".to_string(),
            1,
            true,
        )
        .await
        .unwrap();

    let proxy = fx
        .proxies
        .create(StreamProxyCreate {
            name: "living-room".to_string(),
            description: None,
            proxy_mode: ProxyMode::Redirect,
            is_active: true,
            auto_regenerate: false,
            starting_channel_number: 100,
            numbering_mode: NumberingMode::Sequential,
            cache_channel_logos: false,
            cache_program_logos: false,
            sources: vec![ProxySourceRef {
                source_id: source.id,
                priority_order: 0,
            }],
            epg_sources: Vec::new(),
        })
        .await
        .unwrap();

    // Bind the EPG rows directly (the EPG source record itself is not under
    // test here).
    let epg_binding = EpgBinding {
        source: tvarr::models::EpgSource {
            id: epg_owner,
            name: "guide".to_string(),
            kind: tvarr::models::EpgSourceKind::Xmltv,
            url: "http://up/guide.xml".to_string(),
            username: None,
            password: None,
            is_active: true,
            priority: 1,
            update_cron: String::new(),
            retention_days: 7,
            status: tvarr::models::SourceStatus::Ready,
            last_ingested_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        },
        priority_order: 0,
    };

    let mut ctx = PipelineContext::new(
        proxy.clone(),
        vec![SourceBinding {
            source,
            priority_order: 0,
        }],
        vec![epg_binding],
        "http://tvarr.local".to_string(),
        CancellationToken::new(),
        None,
    );

    let summary = fx.pipeline.run(&mut ctx).await.unwrap();
    assert_eq!(summary.channel_count, 2);

    // Both artifacts exist and parse.
    let m3u = fx
        .sandbox
        .read_to_string(&format!("{}.m3u", proxy.id))
        .await
        .unwrap();
    let xmltv = fx
        .sandbox
        .read_to_string(&format!("{}.xmltv", proxy.id))
        .await
        .unwrap();

    let playlist = parse_playlist(&m3u);
    assert_eq!(playlist.channels.len(), 2);
    assert_eq!(playlist.skipped, 0);

    let hbo = &playlist.channels[0];
    assert_eq!(hbo.channel_name, "HBO");
    assert_eq!(hbo.channel_number, Some(100));
    let bbc = &playlist.channels[1];
    assert_eq!(bbc.channel_name, "UK: BBC News");
    assert_eq!(bbc.channel_number, Some(101));
    assert!(!m3u.contains("Adult"));

    // XMLTV carries programs only for surviving channels.
    let window = (
        Utc::now() - chrono::Duration::days(1),
        Utc::now() + chrono::Duration::days(1),
    );
    let guide = parse_guide(&xmltv, window.0, window.1).unwrap();
    assert_eq!(guide.channels_seen, 2);
    let titles: Vec<&str> = guide.programs.iter().map(|p| p.title.as_str()).collect();
    assert!(titles.contains(&"Movie Night"));
    assert!(titles.contains(&"News at Ten"));
    assert!(!titles.contains(&"Late Show"));
}

/// Export(filters) → import into an empty store yields the same set,
/// ignoring the freshly assigned ids.
#[tokio::test]
async fn filter_export_import_round_trips() {
    let fx = fixture().await;
    fx.rules
        .create_filter(
            "drop-adult".to_string(),
            Some("no adult groups".to_string()),
            RuleDomain::Stream,
            "group_title equals \"Adult\"".to_string(),
            FilterAction::Exclude,
            1,
            true,
        )
        .await
        .unwrap();
    fx.rules
        .create_filter(
            "keep-news".to_string(),
            None,
            RuleDomain::Epg,
            "category equals \"News\"".to_string(),
            FilterAction::Include,
            5,
            false,
        )
        .await
        .unwrap();

    let exported = fx.rules.all_filters().await.unwrap();

    let other = fixture().await;
    other.rules.import_filters(exported.clone()).await.unwrap();
    let imported = other.rules.all_filters().await.unwrap();

    assert_eq!(exported.len(), imported.len());
    for (a, b) in exported.iter().zip(imported.iter()) {
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, b.name);
        assert_eq!(a.description, b.description);
        assert_eq!(a.domain, b.domain);
        assert_eq!(a.expression, b.expression);
        assert_eq!(a.action, b.action);
        assert_eq!(a.priority, b.priority);
        assert_eq!(a.is_active, b.is_active);
    }
}

/// Re-running generation over unchanged inputs produces identical
/// artifacts, and the rename is atomic (no temporaries left behind).
#[tokio::test]
async fn regeneration_is_deterministic_and_leaves_no_temporaries() {
    let fx = fixture().await;

    let source = fx
        .stream_sources
        .create(StreamSourceCreate {
            name: "provider-b".to_string(),
            kind: StreamSourceKind::M3u,
            url: "http://up/b.m3u".to_string(),
            username: None,
            password: None,
            is_active: true,
            priority: 1,
            update_cron: String::new(),
        })
        .await
        .unwrap();
    fx.channels
        .replace_for_source(source.id, vec![channel("One", "A", "one.tv")], 100)
        .await
        .unwrap();

    let proxy = fx
        .proxies
        .create(StreamProxyCreate {
            name: "bedroom".to_string(),
            description: None,
            proxy_mode: ProxyMode::Redirect,
            is_active: true,
            auto_regenerate: false,
            starting_channel_number: 1,
            numbering_mode: NumberingMode::Sequential,
            cache_channel_logos: false,
            cache_program_logos: false,
            sources: vec![ProxySourceRef {
                source_id: source.id,
                priority_order: 0,
            }],
            epg_sources: Vec::new(),
        })
        .await
        .unwrap();

    let make_ctx = |source: tvarr::models::StreamSource| {
        PipelineContext::new(
            proxy.clone(),
            vec![SourceBinding {
                source,
                priority_order: 0,
            }],
            Vec::new(),
            "http://tvarr.local".to_string(),
            CancellationToken::new(),
            None,
        )
    };

    let mut ctx = make_ctx(source.clone());
    fx.pipeline.run(&mut ctx).await.unwrap();
    let first = fx
        .sandbox
        .read_to_string(&format!("{}.m3u", proxy.id))
        .await
        .unwrap();

    let mut ctx = make_ctx(source);
    fx.pipeline.run(&mut ctx).await.unwrap();
    let second = fx
        .sandbox
        .read_to_string(&format!("{}.m3u", proxy.id))
        .await
        .unwrap();

    assert_eq!(first, second);

    let names = fx.sandbox.list_dir("").await.unwrap();
    assert!(
        names.iter().all(|n| !n.contains(".tmp")),
        "temporaries left behind: {names:?}"
    );
}
