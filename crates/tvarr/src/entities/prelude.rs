pub use super::channels::Entity as Channels;
pub use super::data_mapping_rules::Entity as DataMappingRules;
pub use super::epg_programs::Entity as EpgPrograms;
pub use super::epg_sources::Entity as EpgSources;
pub use super::filters::Entity as Filters;
pub use super::job_history::Entity as JobHistory;
pub use super::jobs::Entity as Jobs;
pub use super::proxy_epg_sources::Entity as ProxyEpgSources;
pub use super::proxy_sources::Entity as ProxySources;
pub use super::stream_proxies::Entity as StreamProxies;
pub use super::stream_sources::Entity as StreamSources;
