//! Channel repository.
//!
//! Channels are owned by their source: ingestion replaces the whole set in
//! one transaction so readers never see a half-ingested source.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use ulid::Ulid;

use crate::entities::{channels, prelude::Channels};
use crate::errors::{AppError, AppResult};
use crate::models::Channel;

use super::parse_ulid;

/// A channel as produced by an ingestion handler, before it has an id.
#[derive(Debug, Clone, Default)]
pub struct NewChannel {
    pub external_id: Option<String>,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub channel_name: String,
    pub channel_number: Option<i32>,
    pub stream_url: String,
    pub stream_type: Option<String>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub is_adult: bool,
}

#[derive(Clone)]
pub struct ChannelRepository {
    connection: Arc<DatabaseConnection>,
}

impl ChannelRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    /// Replace every channel of `source_id` with `incoming`, atomically.
    /// Returns the number of inserted rows.
    pub async fn replace_for_source(
        &self,
        source_id: Ulid,
        incoming: Vec<NewChannel>,
        batch_size: usize,
    ) -> AppResult<usize> {
        let now = Utc::now();
        let count = incoming.len();
        let txn = self.connection.begin().await?;

        Channels::delete_many()
            .filter(channels::Column::SourceId.eq(source_id.to_string()))
            .exec(&txn)
            .await?;

        // Monotonic ids keep playlist order stable under ORDER BY id.
        let mut ids = ulid::Generator::new();
        let batch_size = batch_size.max(1);
        for chunk in incoming.chunks(batch_size) {
            let models: Vec<channels::ActiveModel> = chunk
                .iter()
                .map(|c| channels::ActiveModel {
                    id: Set(ids.generate().unwrap_or_else(|_| Ulid::new()).to_string()),
                    source_id: Set(source_id.to_string()),
                    external_id: Set(c.external_id.clone()),
                    tvg_id: Set(c.tvg_id.clone()),
                    tvg_name: Set(c.tvg_name.clone()),
                    tvg_logo: Set(c.tvg_logo.clone()),
                    group_title: Set(c.group_title.clone()),
                    channel_name: Set(c.channel_name.clone()),
                    channel_number: Set(c.channel_number),
                    stream_url: Set(c.stream_url.clone()),
                    stream_type: Set(c.stream_type.clone()),
                    language: Set(c.language.clone()),
                    country: Set(c.country.clone()),
                    is_adult: Set(c.is_adult),
                    created_at: Set(now),
                    updated_at: Set(now),
                })
                .collect();
            if !models.is_empty() {
                Channels::insert_many(models).exec(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(count)
    }

    pub async fn find_by_source(&self, source_id: Ulid) -> AppResult<Vec<Channel>> {
        let rows = Channels::find()
            .filter(channels::Column::SourceId.eq(source_id.to_string()))
            .order_by_asc(channels::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(to_model).collect()
    }

    pub async fn find_by_id(&self, id: Ulid) -> AppResult<Channel> {
        let row = Channels::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("channel", id.to_string()))?;
        to_model(row)
    }

    pub async fn count_all(&self) -> AppResult<u64> {
        Ok(Channels::find().count(&*self.connection).await?)
    }

    pub async fn count_for_source(&self, source_id: Ulid) -> AppResult<u64> {
        Ok(Channels::find()
            .filter(channels::Column::SourceId.eq(source_id.to_string()))
            .count(&*self.connection)
            .await?)
    }

    /// All distinct cached-logo URLs still referenced by any channel.
    /// Logo cleanup keys its eviction on this set.
    pub async fn referenced_logo_urls(&self) -> AppResult<Vec<String>> {
        let rows = Channels::find()
            .filter(channels::Column::TvgLogo.is_not_null())
            .all(&*self.connection)
            .await?;
        let mut urls: Vec<String> = rows.into_iter().filter_map(|r| r.tvg_logo).collect();
        urls.sort();
        urls.dedup();
        Ok(urls)
    }
}

fn to_model(row: channels::Model) -> AppResult<Channel> {
    Ok(Channel {
        id: parse_ulid(&row.id)?,
        source_id: parse_ulid(&row.source_id)?,
        external_id: row.external_id,
        tvg_id: row.tvg_id,
        tvg_name: row.tvg_name,
        tvg_logo: row.tvg_logo,
        group_title: row.group_title,
        channel_name: row.channel_name,
        channel_number: row.channel_number,
        stream_url: row.stream_url,
        stream_type: row.stream_type,
        language: row.language,
        country: row.country,
        is_adult: row.is_adult,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
