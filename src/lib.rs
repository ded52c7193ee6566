pub mod client;
pub mod config;
pub mod db {
    pub mod memory;
    pub mod models;
    pub mod pg;
    pub mod store;
}
pub mod error;
pub mod nilm;
pub mod schema;
pub mod utils;
pub mod services {
    pub mod fake_data;
    pub mod feed;
}

pub use error::NilmError;
pub use nilm::NilmEngine;
