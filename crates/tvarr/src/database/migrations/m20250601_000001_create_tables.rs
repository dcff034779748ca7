//! Initial schema: sources, channels, programs, proxies, rules, jobs.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StreamSources::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(StreamSources::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(StreamSources::Name).string().not_null().unique_key())
                    .col(ColumnDef::new(StreamSources::Kind).string().not_null())
                    .col(ColumnDef::new(StreamSources::Url).text().not_null())
                    .col(ColumnDef::new(StreamSources::Username).string())
                    .col(ColumnDef::new(StreamSources::Password).string())
                    .col(ColumnDef::new(StreamSources::IsActive).boolean().not_null())
                    .col(ColumnDef::new(StreamSources::Priority).integer().not_null())
                    .col(ColumnDef::new(StreamSources::UpdateCron).string().not_null())
                    .col(ColumnDef::new(StreamSources::Status).string().not_null())
                    .col(ColumnDef::new(StreamSources::LastIngestedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(StreamSources::LastError).text())
                    .col(ColumnDef::new(StreamSources::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(StreamSources::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(EpgSources::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(EpgSources::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(EpgSources::Name).string().not_null().unique_key())
                    .col(ColumnDef::new(EpgSources::Kind).string().not_null())
                    .col(ColumnDef::new(EpgSources::Url).text().not_null())
                    .col(ColumnDef::new(EpgSources::Username).string())
                    .col(ColumnDef::new(EpgSources::Password).string())
                    .col(ColumnDef::new(EpgSources::IsActive).boolean().not_null())
                    .col(ColumnDef::new(EpgSources::Priority).integer().not_null())
                    .col(ColumnDef::new(EpgSources::UpdateCron).string().not_null())
                    .col(ColumnDef::new(EpgSources::RetentionDays).integer().not_null())
                    .col(ColumnDef::new(EpgSources::Status).string().not_null())
                    .col(ColumnDef::new(EpgSources::LastIngestedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(EpgSources::LastError).text())
                    .col(ColumnDef::new(EpgSources::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(EpgSources::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Channels::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Channels::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(Channels::SourceId).string_len(26).not_null())
                    .col(ColumnDef::new(Channels::ExternalId).string())
                    .col(ColumnDef::new(Channels::TvgId).string())
                    .col(ColumnDef::new(Channels::TvgName).string())
                    .col(ColumnDef::new(Channels::TvgLogo).text())
                    .col(ColumnDef::new(Channels::GroupTitle).string())
                    .col(ColumnDef::new(Channels::ChannelName).string().not_null())
                    .col(ColumnDef::new(Channels::ChannelNumber).integer())
                    .col(ColumnDef::new(Channels::StreamUrl).text().not_null())
                    .col(ColumnDef::new(Channels::StreamType).string())
                    .col(ColumnDef::new(Channels::Language).string())
                    .col(ColumnDef::new(Channels::Country).string())
                    .col(ColumnDef::new(Channels::IsAdult).boolean().not_null())
                    .col(ColumnDef::new(Channels::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Channels::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_channels_source")
                    .table(Channels::Table)
                    .col(Channels::SourceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(EpgPrograms::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(EpgPrograms::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(EpgPrograms::SourceId).string_len(26).not_null())
                    .col(ColumnDef::new(EpgPrograms::ChannelId).string().not_null())
                    .col(ColumnDef::new(EpgPrograms::Title).text().not_null())
                    .col(ColumnDef::new(EpgPrograms::Description).text())
                    .col(ColumnDef::new(EpgPrograms::Category).string())
                    .col(ColumnDef::new(EpgPrograms::Start).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(EpgPrograms::Stop).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(EpgPrograms::Icon).text())
                    .col(ColumnDef::new(EpgPrograms::Rating).string())
                    .col(ColumnDef::new(EpgPrograms::IsNew).boolean().not_null())
                    .col(ColumnDef::new(EpgPrograms::IsPremiere).boolean().not_null())
                    .col(ColumnDef::new(EpgPrograms::IsLive).boolean().not_null())
                    .col(ColumnDef::new(EpgPrograms::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(EpgPrograms::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_programs_source")
                    .table(EpgPrograms::Table)
                    .col(EpgPrograms::SourceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_programs_channel_start")
                    .table(EpgPrograms::Table)
                    .col(EpgPrograms::ChannelId)
                    .col(EpgPrograms::Start)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(StreamProxies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(StreamProxies::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(StreamProxies::Name).string().not_null().unique_key())
                    .col(ColumnDef::new(StreamProxies::Description).text())
                    .col(ColumnDef::new(StreamProxies::ProxyMode).string().not_null())
                    .col(ColumnDef::new(StreamProxies::IsActive).boolean().not_null())
                    .col(ColumnDef::new(StreamProxies::AutoRegenerate).boolean().not_null())
                    .col(ColumnDef::new(StreamProxies::StartingChannelNumber).integer().not_null())
                    .col(ColumnDef::new(StreamProxies::NumberingMode).string().not_null())
                    .col(ColumnDef::new(StreamProxies::CacheChannelLogos).boolean().not_null())
                    .col(ColumnDef::new(StreamProxies::CacheProgramLogos).boolean().not_null())
                    .col(ColumnDef::new(StreamProxies::Status).string().not_null())
                    .col(ColumnDef::new(StreamProxies::LastGeneratedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(StreamProxies::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(StreamProxies::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ProxySources::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ProxySources::ProxyId).string_len(26).not_null())
                    .col(ColumnDef::new(ProxySources::SourceId).string_len(26).not_null())
                    .col(ColumnDef::new(ProxySources::PriorityOrder).integer().not_null())
                    .col(ColumnDef::new(ProxySources::CreatedAt).timestamp_with_time_zone().not_null())
                    .primary_key(
                        Index::create()
                            .col(ProxySources::ProxyId)
                            .col(ProxySources::SourceId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ProxyEpgSources::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ProxyEpgSources::ProxyId).string_len(26).not_null())
                    .col(ColumnDef::new(ProxyEpgSources::EpgSourceId).string_len(26).not_null())
                    .col(ColumnDef::new(ProxyEpgSources::PriorityOrder).integer().not_null())
                    .col(ColumnDef::new(ProxyEpgSources::CreatedAt).timestamp_with_time_zone().not_null())
                    .primary_key(
                        Index::create()
                            .col(ProxyEpgSources::ProxyId)
                            .col(ProxyEpgSources::EpgSourceId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Filters::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Filters::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(Filters::Name).string().not_null())
                    .col(ColumnDef::new(Filters::Description).text())
                    .col(ColumnDef::new(Filters::Domain).string().not_null())
                    .col(ColumnDef::new(Filters::Expression).text().not_null())
                    .col(ColumnDef::new(Filters::Action).string().not_null())
                    .col(ColumnDef::new(Filters::Priority).integer().not_null())
                    .col(ColumnDef::new(Filters::IsActive).boolean().not_null())
                    .col(ColumnDef::new(Filters::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Filters::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DataMappingRules::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(DataMappingRules::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(DataMappingRules::Name).string().not_null())
                    .col(ColumnDef::new(DataMappingRules::Description).text())
                    .col(ColumnDef::new(DataMappingRules::Domain).string().not_null())
                    .col(ColumnDef::new(DataMappingRules::Expression).text().not_null())
                    .col(ColumnDef::new(DataMappingRules::Priority).integer().not_null())
                    .col(ColumnDef::new(DataMappingRules::IsActive).boolean().not_null())
                    .col(ColumnDef::new(DataMappingRules::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(DataMappingRules::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(Jobs::Kind).string().not_null())
                    .col(ColumnDef::new(Jobs::TargetId).string_len(26))
                    .col(ColumnDef::new(Jobs::Status).string().not_null())
                    .col(ColumnDef::new(Jobs::NextRunAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Jobs::AttemptCount).integer().not_null())
                    .col(ColumnDef::new(Jobs::MaxAttempts).integer().not_null())
                    .col(ColumnDef::new(Jobs::BaseBackoffMs).big_integer().not_null())
                    .col(ColumnDef::new(Jobs::LastError).text())
                    .col(ColumnDef::new(Jobs::Result).text())
                    .col(ColumnDef::new(Jobs::StartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Jobs::FinishedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Jobs::WorkerId).string().not_null())
                    .col(ColumnDef::new(Jobs::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Jobs::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // The claim scan: claimable rows ordered by due time.
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_status_next_run")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .col(Jobs::NextRunAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobHistory::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(JobHistory::Id).string_len(26).not_null().primary_key())
                    .col(ColumnDef::new(JobHistory::JobId).string_len(26).not_null())
                    .col(ColumnDef::new(JobHistory::Kind).string().not_null())
                    .col(ColumnDef::new(JobHistory::TargetId).string_len(26))
                    .col(ColumnDef::new(JobHistory::Attempt).integer().not_null())
                    .col(ColumnDef::new(JobHistory::StartedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(JobHistory::FinishedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(JobHistory::Outcome).string().not_null())
                    .col(ColumnDef::new(JobHistory::Error).text())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_history_job")
                    .table(JobHistory::Table)
                    .col(JobHistory::JobId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in [
            "job_history",
            "jobs",
            "data_mapping_rules",
            "filters",
            "proxy_epg_sources",
            "proxy_sources",
            "stream_proxies",
            "epg_programs",
            "channels",
            "epg_sources",
            "stream_sources",
        ] {
            manager
                .drop_table(Table::drop().table(Alias::new(table)).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}

#[derive(DeriveIden)]
enum StreamSources {
    Table,
    Id,
    Name,
    Kind,
    Url,
    Username,
    Password,
    IsActive,
    Priority,
    UpdateCron,
    Status,
    LastIngestedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum EpgSources {
    Table,
    Id,
    Name,
    Kind,
    Url,
    Username,
    Password,
    IsActive,
    Priority,
    UpdateCron,
    RetentionDays,
    Status,
    LastIngestedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Channels {
    Table,
    Id,
    SourceId,
    ExternalId,
    TvgId,
    TvgName,
    TvgLogo,
    GroupTitle,
    ChannelName,
    ChannelNumber,
    StreamUrl,
    StreamType,
    Language,
    Country,
    IsAdult,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum EpgPrograms {
    Table,
    Id,
    SourceId,
    ChannelId,
    Title,
    Description,
    Category,
    Start,
    Stop,
    Icon,
    Rating,
    IsNew,
    IsPremiere,
    IsLive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum StreamProxies {
    Table,
    Id,
    Name,
    Description,
    ProxyMode,
    IsActive,
    AutoRegenerate,
    StartingChannelNumber,
    NumberingMode,
    CacheChannelLogos,
    CacheProgramLogos,
    Status,
    LastGeneratedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ProxySources {
    Table,
    ProxyId,
    SourceId,
    PriorityOrder,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ProxyEpgSources {
    Table,
    ProxyId,
    EpgSourceId,
    PriorityOrder,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Filters {
    Table,
    Id,
    Name,
    Description,
    Domain,
    Expression,
    Action,
    Priority,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DataMappingRules {
    Table,
    Id,
    Name,
    Description,
    Domain,
    Expression,
    Priority,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Kind,
    TargetId,
    Status,
    NextRunAt,
    AttemptCount,
    MaxAttempts,
    BaseBackoffMs,
    LastError,
    Result,
    StartedAt,
    FinishedAt,
    WorkerId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum JobHistory {
    Table,
    Id,
    JobId,
    Kind,
    TargetId,
    Attempt,
    StartedAt,
    FinishedAt,
    Outcome,
    Error,
}
