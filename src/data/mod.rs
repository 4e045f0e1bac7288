pub mod bar_aggregator;
pub mod fetcher;
pub mod models;
pub mod stream;
