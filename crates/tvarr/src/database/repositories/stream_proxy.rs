//! Stream proxy repository.
//!
//! A proxy row plus its ordered source references are written and read as
//! one unit; reference rewrites happen inside a transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use ulid::Ulid;

use crate::entities::{
    prelude::{ProxyEpgSources, ProxySources, StreamProxies},
    proxy_epg_sources, proxy_sources, stream_proxies,
};
use crate::errors::{AppError, AppResult};
use crate::models::{NumberingMode, ProxyMode, ProxySourceRef, ProxyStatus, StreamProxy};

use super::{parse_enum, parse_ulid};

#[derive(Debug, Clone)]
pub struct StreamProxyCreate {
    pub name: String,
    pub description: Option<String>,
    pub proxy_mode: ProxyMode,
    pub is_active: bool,
    pub auto_regenerate: bool,
    pub starting_channel_number: i32,
    pub numbering_mode: NumberingMode,
    pub cache_channel_logos: bool,
    pub cache_program_logos: bool,
    pub sources: Vec<ProxySourceRef>,
    pub epg_sources: Vec<ProxySourceRef>,
}

#[derive(Clone)]
pub struct StreamProxyRepository {
    connection: Arc<DatabaseConnection>,
}

impl StreamProxyRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    pub async fn create(&self, request: StreamProxyCreate) -> AppResult<StreamProxy> {
        if request.starting_channel_number < 1 {
            return Err(AppError::validation(
                "starting_channel_number must be at least 1",
            ));
        }
        if StreamProxies::find()
            .filter(stream_proxies::Column::Name.eq(request.name.clone()))
            .one(&*self.connection)
            .await?
            .is_some()
        {
            return Err(AppError::conflict(format!(
                "proxy '{}' already exists",
                request.name
            )));
        }

        let now = Utc::now();
        let id = Ulid::new();
        let txn = self.connection.begin().await?;

        stream_proxies::ActiveModel {
            id: Set(id.to_string()),
            name: Set(request.name),
            description: Set(request.description),
            proxy_mode: Set(request.proxy_mode.to_string()),
            is_active: Set(request.is_active),
            auto_regenerate: Set(request.auto_regenerate),
            starting_channel_number: Set(request.starting_channel_number),
            numbering_mode: Set(request.numbering_mode.to_string()),
            cache_channel_logos: Set(request.cache_channel_logos),
            cache_program_logos: Set(request.cache_program_logos),
            status: Set(ProxyStatus::Pending.to_string()),
            last_generated_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for source in &request.sources {
            proxy_sources::ActiveModel {
                proxy_id: Set(id.to_string()),
                source_id: Set(source.source_id.to_string()),
                priority_order: Set(source.priority_order),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }
        for source in &request.epg_sources {
            proxy_epg_sources::ActiveModel {
                proxy_id: Set(id.to_string()),
                epg_source_id: Set(source.source_id.to_string()),
                priority_order: Set(source.priority_order),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        self.find_by_id(id).await
    }

    pub async fn find_by_id(&self, id: Ulid) -> AppResult<StreamProxy> {
        let row = StreamProxies::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("proxy", id.to_string()))?;
        self.attach_refs(row).await
    }

    pub async fn find_all(&self) -> AppResult<Vec<StreamProxy>> {
        let rows = StreamProxies::find()
            .order_by_asc(stream_proxies::Column::Id)
            .all(&*self.connection)
            .await?;
        let mut proxies = Vec::with_capacity(rows.len());
        for row in rows {
            proxies.push(self.attach_refs(row).await?);
        }
        Ok(proxies)
    }

    pub async fn find_active(&self) -> AppResult<Vec<StreamProxy>> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .filter(|p| p.is_active)
            .collect())
    }

    /// Proxies that reference `source_id` (as stream or EPG source) and
    /// regenerate automatically after its ingestion.
    pub async fn find_auto_regenerate_for_source(
        &self,
        source_id: Ulid,
    ) -> AppResult<Vec<StreamProxy>> {
        let mut proxy_ids: Vec<String> = ProxySources::find()
            .filter(proxy_sources::Column::SourceId.eq(source_id.to_string()))
            .all(&*self.connection)
            .await?
            .into_iter()
            .map(|r| r.proxy_id)
            .collect();
        proxy_ids.extend(
            ProxyEpgSources::find()
                .filter(proxy_epg_sources::Column::EpgSourceId.eq(source_id.to_string()))
                .all(&*self.connection)
                .await?
                .into_iter()
                .map(|r| r.proxy_id),
        );
        proxy_ids.sort();
        proxy_ids.dedup();

        let mut result = Vec::new();
        for proxy_id in proxy_ids {
            let proxy = self.find_by_id(parse_ulid(&proxy_id)?).await?;
            if proxy.is_active && proxy.auto_regenerate {
                result.push(proxy);
            }
        }
        Ok(result)
    }

    pub async fn set_status(
        &self,
        id: Ulid,
        status: ProxyStatus,
    ) -> AppResult<()> {
        let row = StreamProxies::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("proxy", id.to_string()))?;
        let mut active: stream_proxies::ActiveModel = row.into();
        active.status = Set(status.to_string());
        active.updated_at = Set(Utc::now());
        active.update(&*self.connection).await?;
        Ok(())
    }

    pub async fn mark_generated(&self, id: Ulid, at: DateTime<Utc>) -> AppResult<()> {
        let row = StreamProxies::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("proxy", id.to_string()))?;
        let mut active: stream_proxies::ActiveModel = row.into();
        active.status = Set(ProxyStatus::Ready.to_string());
        active.last_generated_at = Set(Some(at));
        active.updated_at = Set(at);
        active.update(&*self.connection).await?;
        Ok(())
    }

    async fn attach_refs(&self, row: stream_proxies::Model) -> AppResult<StreamProxy> {
        let sources = ProxySources::find()
            .filter(proxy_sources::Column::ProxyId.eq(row.id.clone()))
            .order_by_asc(proxy_sources::Column::PriorityOrder)
            .all(&*self.connection)
            .await?;
        let epg_sources = ProxyEpgSources::find()
            .filter(proxy_epg_sources::Column::ProxyId.eq(row.id.clone()))
            .order_by_asc(proxy_epg_sources::Column::PriorityOrder)
            .all(&*self.connection)
            .await?;

        Ok(StreamProxy {
            id: parse_ulid(&row.id)?,
            name: row.name,
            description: row.description,
            proxy_mode: parse_enum(&row.proxy_mode, "proxy mode")?,
            is_active: row.is_active,
            auto_regenerate: row.auto_regenerate,
            starting_channel_number: row.starting_channel_number,
            numbering_mode: parse_enum(&row.numbering_mode, "numbering mode")?,
            cache_channel_logos: row.cache_channel_logos,
            cache_program_logos: row.cache_program_logos,
            status: parse_enum(&row.status, "proxy status")?,
            last_generated_at: row.last_generated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sources: sources
                .into_iter()
                .map(|s| {
                    Ok(ProxySourceRef {
                        source_id: parse_ulid(&s.source_id)?,
                        priority_order: s.priority_order,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?,
            epg_sources: epg_sources
                .into_iter()
                .map(|s| {
                    Ok(ProxySourceRef {
                        source_id: parse_ulid(&s.epg_source_id)?,
                        priority_order: s.priority_order,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?,
        })
    }
}
