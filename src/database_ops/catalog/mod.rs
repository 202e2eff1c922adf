pub mod client;
pub mod http;
pub mod mapping;
pub mod scripted;

pub use client::{CatalogError, CatalogPage, RawRecord, RemoteCatalogClient};
pub use http::{HttpCatalogClient, HttpCatalogConfig};
pub use mapping::{map_record, ProductRecord, RecordMappingError};
pub use scripted::ScriptedCatalogClient;
