//! Database models split into separate files.

pub mod notification;
pub mod notification_log;
pub mod outbox;
pub mod subscription;
pub mod webhook;

pub use self::notification::*;
pub use self::notification_log::*;
pub use self::outbox::*;
pub use self::subscription::*;
pub use self::webhook::*;
