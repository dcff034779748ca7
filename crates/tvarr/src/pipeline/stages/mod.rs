pub mod data_mapping;
pub mod filtering;
pub mod ingestion_guard;
pub mod load_channels;
pub mod load_programs;
pub mod logo_caching;
pub mod numbering;
pub mod publish;
pub mod render_m3u;
pub mod render_xmltv;

pub use data_mapping::DataMappingStage;
pub use filtering::FilteringStage;
pub use ingestion_guard::IngestionGuardStage;
pub use load_channels::LoadChannelsStage;
pub use load_programs::LoadProgramsStage;
pub use logo_caching::LogoCachingStage;
pub use numbering::NumberingStage;
pub use publish::PublishStage;
pub use render_m3u::RenderM3uStage;
pub use render_xmltv::RenderXmltvStage;
