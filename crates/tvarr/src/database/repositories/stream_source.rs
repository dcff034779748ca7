//! Stream source repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use ulid::Ulid;

use crate::entities::{prelude::StreamSources, stream_sources};
use crate::errors::{AppError, AppResult};
use crate::models::{SourceStatus, StreamSource, StreamSourceKind};
use crate::utils::CredentialVault;

use super::{parse_enum, parse_ulid};

#[derive(Debug, Clone)]
pub struct StreamSourceCreate {
    pub name: String,
    pub kind: StreamSourceKind,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub update_cron: String,
}

#[derive(Clone)]
pub struct StreamSourceRepository {
    connection: Arc<DatabaseConnection>,
    vault: CredentialVault,
}

impl StreamSourceRepository {
    pub fn new(connection: Arc<DatabaseConnection>, vault: CredentialVault) -> Self {
        Self { connection, vault }
    }

    pub async fn create(&self, request: StreamSourceCreate) -> AppResult<StreamSource> {
        validate_source(&request.kind, &request.url, &request.update_cron)?;

        if StreamSources::find()
            .filter(stream_sources::Column::Name.eq(request.name.clone()))
            .one(&*self.connection)
            .await?
            .is_some()
        {
            return Err(AppError::conflict(format!(
                "stream source '{}' already exists",
                request.name
            )));
        }

        let now = Utc::now();
        let id = Ulid::new();
        let model = stream_sources::ActiveModel {
            id: Set(id.to_string()),
            name: Set(request.name),
            kind: Set(request.kind.to_string()),
            url: Set(request.url),
            username: Set(request.username.map(|u| self.vault.seal(&u))),
            password: Set(request.password.map(|p| self.vault.seal(&p))),
            is_active: Set(request.is_active),
            priority: Set(request.priority),
            update_cron: Set(request.update_cron),
            status: Set(SourceStatus::Pending.to_string()),
            last_ingested_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = model.insert(&*self.connection).await?;
        self.to_model(inserted)
    }

    pub async fn find_all(&self) -> AppResult<Vec<StreamSource>> {
        let rows = StreamSources::find()
            .order_by_asc(stream_sources::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(|r| self.to_model(r)).collect()
    }

    pub async fn find_active(&self) -> AppResult<Vec<StreamSource>> {
        let rows = StreamSources::find()
            .filter(stream_sources::Column::IsActive.eq(true))
            .order_by_asc(stream_sources::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(|r| self.to_model(r)).collect()
    }

    pub async fn find_by_id(&self, id: Ulid) -> AppResult<StreamSource> {
        let row = StreamSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("stream source", id.to_string()))?;
        self.to_model(row)
    }

    pub async fn set_status(
        &self,
        id: Ulid,
        status: SourceStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        let row = StreamSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("stream source", id.to_string()))?;
        let mut active: stream_sources::ActiveModel = row.into();
        active.status = Set(status.to_string());
        active.last_error = Set(error);
        active.updated_at = Set(Utc::now());
        active.update(&*self.connection).await?;
        Ok(())
    }

    pub async fn mark_ingested(&self, id: Ulid, at: DateTime<Utc>) -> AppResult<()> {
        let row = StreamSources::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("stream source", id.to_string()))?;
        let mut active: stream_sources::ActiveModel = row.into();
        active.status = Set(SourceStatus::Ready.to_string());
        active.last_ingested_at = Set(Some(at));
        active.last_error = Set(None);
        active.updated_at = Set(at);
        active.update(&*self.connection).await?;
        Ok(())
    }

    pub async fn delete(&self, id: Ulid) -> AppResult<()> {
        let result = StreamSources::delete_by_id(id.to_string())
            .exec(&*self.connection)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::not_found("stream source", id.to_string()));
        }
        Ok(())
    }

    fn to_model(&self, row: stream_sources::Model) -> AppResult<StreamSource> {
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
        Ok(StreamSource {
            id: parse_ulid(&row.id)?,
            name: row.name,
            kind: parse_enum(&row.kind, "stream source kind")?,
            url: row.url,
            username,
            password,
            is_active: row.is_active,
            priority: row.priority,
            update_cron: row.update_cron,
            status: parse_enum(&row.status, "source status")?,
            last_ingested_at: row.last_ingested_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn validate_source(kind: &StreamSourceKind, url: &str, update_cron: &str) -> AppResult<()> {
    match kind {
        StreamSourceKind::Manual => {
            if !url.is_empty() {
                return Err(AppError::validation("manual sources must have an empty URL"));
            }
        }
        _ => {
            if url.is_empty() {
                return Err(AppError::validation("source URL is required"));
            }
        }
    }
    if !update_cron.is_empty() {
        crate::utils::cron::validate(update_cron).map_err(AppError::validation)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_sources_must_not_carry_a_url() {
        assert!(
            validate_source(&StreamSourceKind::Manual, "http://x", "").is_err()
        );
        assert!(validate_source(&StreamSourceKind::Manual, "", "").is_ok());
    }

    #[test]
    fn cron_is_validated_when_present() {
        assert!(validate_source(&StreamSourceKind::M3u, "http://x", "nonsense").is_err());
        assert!(validate_source(&StreamSourceKind::M3u, "http://x", "0 0 3 * * *").is_ok());
        assert!(validate_source(&StreamSourceKind::M3u, "http://x", "").is_ok());
    }
}
