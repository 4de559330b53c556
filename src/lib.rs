pub mod models {
    pub mod series;
}

pub mod client;
pub mod config;
pub mod configuration;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod error;
pub mod home;
pub mod power;
pub mod resample;
pub mod schema;
pub mod sensor;
pub mod source;
pub mod services {
    pub mod fake_data;
    pub mod ingest;
    pub mod sync;
}
pub mod store;
pub mod utils;
