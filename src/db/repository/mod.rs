pub mod notification;
pub mod notification_log;
pub mod outbox;
pub mod subscription;
pub mod webhook;

pub use notification::NotificationRepository;
pub use notification_log::NotificationLogRepository;
pub use outbox::OutboxRepository;
pub use subscription::SubscriptionRepository;
pub use webhook::WebhookRepository;
