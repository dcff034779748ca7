use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_epg_sources")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub proxy_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub epg_source_id: String,
    pub priority_order: i32,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
