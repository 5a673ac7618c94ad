pub mod notifier;
pub mod order_expiry;
pub mod subscriptions;
