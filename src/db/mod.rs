pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

use chrono::NaiveDateTime;

pub fn now_utc() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}
