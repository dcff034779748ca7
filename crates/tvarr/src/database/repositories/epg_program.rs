//! EPG program repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use ulid::Ulid;

use crate::entities::{epg_programs, prelude::EpgPrograms};
use crate::errors::AppResult;
use crate::models::EpgProgram;

use super::parse_ulid;

#[derive(Debug, Clone)]
pub struct NewEpgProgram {
    pub channel_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub icon: Option<String>,
    pub rating: Option<String>,
    pub is_new: bool,
    pub is_premiere: bool,
    pub is_live: bool,
}

#[derive(Clone)]
pub struct EpgProgramRepository {
    connection: Arc<DatabaseConnection>,
}

impl EpgProgramRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    /// Replace every program of `source_id`, atomically.
    pub async fn replace_for_source(
        &self,
        source_id: Ulid,
        incoming: Vec<NewEpgProgram>,
        batch_size: usize,
    ) -> AppResult<usize> {
        let now = Utc::now();
        let count = incoming.len();
        let txn = self.connection.begin().await?;

        EpgPrograms::delete_many()
            .filter(epg_programs::Column::SourceId.eq(source_id.to_string()))
            .exec(&txn)
            .await?;

        let mut ids = ulid::Generator::new();
        let batch_size = batch_size.max(1);
        for chunk in incoming.chunks(batch_size) {
            let models: Vec<epg_programs::ActiveModel> = chunk
                .iter()
                .map(|p| epg_programs::ActiveModel {
                    id: Set(ids.generate().unwrap_or_else(|_| Ulid::new()).to_string()),
                    source_id: Set(source_id.to_string()),
                    channel_id: Set(p.channel_id.clone()),
                    title: Set(p.title.clone()),
                    description: Set(p.description.clone()),
                    category: Set(p.category.clone()),
                    start: Set(p.start),
                    stop: Set(p.stop),
                    icon: Set(p.icon.clone()),
                    rating: Set(p.rating.clone()),
                    is_new: Set(p.is_new),
                    is_premiere: Set(p.is_premiere),
                    is_live: Set(p.is_live),
                    created_at: Set(now),
                    updated_at: Set(now),
                })
                .collect();
            if !models.is_empty() {
                EpgPrograms::insert_many(models).exec(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(count)
    }

    /// Programs of one source for the given tvg channel ids, bounded by a
    /// time window, ordered (channel_id, start) for rendering.
    pub async fn find_for_channels(
        &self,
        source_id: Ulid,
        channel_ids: &[String],
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> AppResult<Vec<EpgProgram>> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = EpgPrograms::find()
            .filter(epg_programs::Column::SourceId.eq(source_id.to_string()))
            .filter(epg_programs::Column::ChannelId.is_in(channel_ids.iter().cloned()))
            .filter(epg_programs::Column::Stop.gte(from))
            .filter(epg_programs::Column::Start.lte(until))
            .order_by_asc(epg_programs::Column::ChannelId)
            .order_by_asc(epg_programs::Column::Start)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(to_model).collect()
    }

    pub async fn count_all(&self) -> AppResult<u64> {
        use sea_orm::PaginatorTrait;
        Ok(EpgPrograms::find().count(&*self.connection).await?)
    }

    /// Drop programs of a source outside its retention window.
    pub async fn prune_outside_window(
        &self,
        source_id: Ulid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = EpgPrograms::delete_many()
            .filter(epg_programs::Column::SourceId.eq(source_id.to_string()))
            .filter(
                epg_programs::Column::Stop
                    .lt(from)
                    .or(epg_programs::Column::Start.gt(until)),
            )
            .exec(&*self.connection)
            .await?;
        Ok(result.rows_affected)
    }
}

fn to_model(row: epg_programs::Model) -> AppResult<EpgProgram> {
    Ok(EpgProgram {
        id: parse_ulid(&row.id)?,
        source_id: parse_ulid(&row.source_id)?,
        channel_id: row.channel_id,
        title: row.title,
        description: row.description,
        category: row.category,
        start: row.start,
        stop: row.stop,
        icon: row.icon,
        rating: row.rating,
        is_new: row.is_new,
        is_premiere: row.is_premiere,
        is_live: row.is_live,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
