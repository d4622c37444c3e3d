pub mod analysis;
pub mod download;
pub mod extract;
pub mod fetch;
pub mod health;
pub mod links;
pub mod meta;
pub mod output;
pub mod reading;
pub mod timeseries;
