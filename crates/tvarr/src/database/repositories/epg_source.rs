//! EPG source repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use ulid::Ulid;

use crate::entities::{epg_sources, prelude::EpgSources};
use crate::errors::{AppError, AppResult};
use crate::models::{EpgSource, EpgSourceKind, SourceStatus};
use crate::utils::CredentialVault;

use super::{parse_enum, parse_ulid};

#[derive(Debug, Clone)]
pub struct EpgSourceCreate {
    pub name: String,
    pub kind: EpgSourceKind,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub update_cron: String,
    pub retention_days: i32,
}

#[derive(Clone)]
pub struct EpgSourceRepository {
    connection: Arc<DatabaseConnection>,
    vault: CredentialVault,
}

impl EpgSourceRepository {
    pub fn new(connection: Arc<DatabaseConnection>, vault: CredentialVault) -> Self {
        Self { connection, vault }
    }

    pub async fn create(&self, request: EpgSourceCreate) -> AppResult<EpgSource> {
        if request.url.is_empty() {
            return Err(AppError::validation("EPG source URL is required"));
        }
        if !request.update_cron.is_empty() {
            crate::utils::cron::validate(&request.update_cron).map_err(AppError::validation)?;
        }
        if request.retention_days <= 0 {
            return Err(AppError::validation("retention_days must be positive"));
        }

        if EpgSources::find()
            .filter(epg_sources::Column::Name.eq(request.name.clone()))
            .one(&*self.connection)
            .await?
            .is_some()
        {
            return Err(AppError::conflict(format!(
                "EPG source '{}' already exists",
                request.name
            )));
        }

        let now = Utc::now();
        let model = epg_sources::ActiveModel {
            id: Set(Ulid::new().to_string()),
            name: Set(request.name),
            kind: Set(request.kind.to_string()),
            url: Set(request.url),
            username: Set(request.username.map(|u| self.vault.seal(&u))),
            password: Set(request.password.map(|p| self.vault.seal(&p))),
            is_active: Set(request.is_active),
            priority: Set(request.priority),
            update_cron: Set(request.update_cron),
            retention_days: Set(request.retention_days),
            status: Set(SourceStatus::Pending.to_string()),
            last_ingested_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = model.insert(&*self.connection).await?;
        self.to_model(inserted)
    }

    pub async fn find_all(&self) -> AppResult<Vec<EpgSource>> {
        let rows = EpgSources::find()
            .order_by_asc(epg_sources::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(|r| self.to_model(r)).collect()
    }

    pub async fn find_active(&self) -> AppResult<Vec<EpgSource>> {
        let rows = EpgSources::find()
            .filter(epg_sources::Column::IsActive.eq(true))
            .order_by_asc(epg_sources::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(|r| self.to_model(r)).collect()
    }

    pub async fn find_by_id(&self, id: Ulid) -> AppResult<EpgSource> {
        let row = EpgSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("EPG source", id.to_string()))?;
        self.to_model(row)
    }

    pub async fn set_status(
        &self,
        id: Ulid,
        status: SourceStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        let row = EpgSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("EPG source", id.to_string()))?;
        let mut active: epg_sources::ActiveModel = row.into();
        active.status = Set(status.to_string());
        active.last_error = Set(error);
        active.updated_at = Set(Utc::now());
        active.update(&*self.connection).await?;
        Ok(())
    }

    pub async fn mark_ingested(&self, id: Ulid, at: DateTime<Utc>) -> AppResult<()> {
        let row = EpgSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("EPG source", id.to_string()))?;
        let mut active: epg_sources::ActiveModel = row.into();
        active.status = Set(SourceStatus::Ready.to_string());
        active.last_ingested_at = Set(Some(at));
        active.last_error = Set(None);
        active.updated_at = Set(at);
        active.update(&*self.connection).await?;
        Ok(())
    }

    pub async fn delete(&self, id: Ulid) -> AppResult<()> {
        let result = EpgSources::delete_by_id(id.to_string())
            .exec(&*self.connection)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::not_found("EPG source", id.to_string()));
        }
        Ok(())
    }

    fn to_model(&self, row: epg_sources::Model) -> AppResult<EpgSource> {
        let username = row
            .username
            .map(|u| self.vault.open(&u))
            .transpose()
            .map_err(AppError::internal)?;
        let password = row
            .password
            .map(|p| self.vault.open(&p))
            .transpose()
            .map_err(AppError::internal)?;
        Ok(EpgSource {
            id: parse_ulid(&row.id)?,
            name: row.name,
            kind: parse_enum(&row.kind, "EPG source kind")?,
            url: row.url,
            username,
            password,
            is_active: row.is_active,
            priority: row.priority,
            update_cron: row.update_cron,
            retention_days: row.retention_days,
            status: parse_enum(&row.status, "source status")?,
            last_ingested_at: row.last_ingested_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
