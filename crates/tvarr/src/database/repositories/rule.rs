//! Filter and data-mapping rule repository.
//!
//! Rules are free-standing, referenced by domain. Expressions are validated
//! against the expression engine at save time; a rule the engine rejects
//! never reaches the store.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use ulid::Ulid;

use crate::entities::{data_mapping_rules, filters, prelude::{DataMappingRules, Filters}};
use crate::errors::{AppError, AppResult};
use crate::expression;
use crate::models::{DataMappingRule, FilterAction, FilterRule, RuleDomain};

use super::{parse_enum, parse_ulid};

#[derive(Clone)]
pub struct RuleRepository {
    connection: Arc<DatabaseConnection>,
}

impl RuleRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    pub async fn create_filter(
        &self,
        name: String,
        description: Option<String>,
        domain: RuleDomain,
        expression_text: String,
        action: FilterAction,
        priority: i32,
        is_active: bool,
    ) -> AppResult<FilterRule> {
        // Filters are condition-only; an action list is a validation error.
        let parsed = expression::validate(&expression_text, domain.into())?;
        if parsed.has_actions() {
            return Err(AppError::validation(
                "filter expressions cannot carry actions; use a data-mapping rule",
            ));
        }

        let now = Utc::now();
        let model = filters::ActiveModel {
            id: Set(Ulid::new().to_string()),
            name: Set(name),
            description: Set(description),
            domain: Set(domain.to_string()),
            expression: Set(expression_text),
            action: Set(action.to_string()),
            priority: Set(priority),
            is_active: Set(is_active),
            created_at: Set(now),
            updated_at: Set(now),
        };
        filter_to_model(model.insert(&*self.connection).await?)
    }

    pub async fn create_mapping(
        &self,
        name: String,
        description: Option<String>,
        domain: RuleDomain,
        expression_text: String,
        priority: i32,
        is_active: bool,
    ) -> AppResult<DataMappingRule> {
        expression::validate(&expression_text, domain.into())?;

        let now = Utc::now();
        let model = data_mapping_rules::ActiveModel {
            id: Set(Ulid::new().to_string()),
            name: Set(name),
            description: Set(description),
            domain: Set(domain.to_string()),
            expression: Set(expression_text),
            priority: Set(priority),
            is_active: Set(is_active),
            created_at: Set(now),
            updated_at: Set(now),
        };
        mapping_to_model(model.insert(&*self.connection).await?)
    }

    /// Active filters for a domain in evaluation order (ascending priority,
    /// id as the stable tie-break).
    pub async fn active_filters(&self, domain: RuleDomain) -> AppResult<Vec<FilterRule>> {
        let rows = Filters::find()
            .filter(filters::Column::Domain.eq(domain.to_string()))
            .filter(filters::Column::IsActive.eq(true))
            .order_by_asc(filters::Column::Priority)
            .order_by_asc(filters::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(filter_to_model).collect()
    }

    pub async fn active_mappings(&self, domain: RuleDomain) -> AppResult<Vec<DataMappingRule>> {
        let rows = DataMappingRules::find()
            .filter(data_mapping_rules::Column::Domain.eq(domain.to_string()))
            .filter(data_mapping_rules::Column::IsActive.eq(true))
            .order_by_asc(data_mapping_rules::Column::Priority)
            .order_by_asc(data_mapping_rules::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(mapping_to_model).collect()
    }

    pub async fn all_filters(&self) -> AppResult<Vec<FilterRule>> {
        let rows = Filters::find()
            .order_by_asc(filters::Column::Priority)
            .order_by_asc(filters::Column::Id)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(filter_to_model).collect()
    }

    /// Import filters exported from another install; ids are reassigned.
    pub async fn import_filters(&self, rules: Vec<FilterRule>) -> AppResult<usize> {
        let mut imported = 0;
        for rule in rules {
            self.create_filter(
                rule.name,
                rule.description,
                rule.domain,
                rule.expression,
                rule.action,
                rule.priority,
                rule.is_active,
            )
            .await?;
            imported += 1;
        }
        Ok(imported)
    }

    pub async fn delete_filter(&self, id: Ulid) -> AppResult<()> {
        let result = Filters::delete_by_id(id.to_string())
            .exec(&*self.connection)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::not_found("filter", id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_mapping(&self, id: Ulid) -> AppResult<()> {
        let result = DataMappingRules::delete_by_id(id.to_string())
            .exec(&*self.connection)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::not_found("data-mapping rule", id.to_string()));
        }
        Ok(())
    }
}

fn filter_to_model(row: filters::Model) -> AppResult<FilterRule> {
    Ok(FilterRule {
        id: parse_ulid(&row.id)?,
        name: row.name,
        description: row.description,
        domain: parse_enum(&row.domain, "rule domain")?,
        expression: row.expression,
        action: parse_enum(&row.action, "filter action")?,
        priority: row.priority,
        is_active: row.is_active,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn mapping_to_model(row: data_mapping_rules::Model) -> AppResult<DataMappingRule> {
    Ok(DataMappingRule {
        id: parse_ulid(&row.id)?,
        name: row.name,
        description: row.description,
        domain: parse_enum(&row.domain, "rule domain")?,
        expression: row.expression,
        priority: row.priority,
        is_active: row.is_active,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
