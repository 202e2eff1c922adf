pub mod catalog;
pub mod db;
pub mod products;
pub mod sync_runs;
