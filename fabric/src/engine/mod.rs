pub mod broadcaster;
pub mod chat_engine;
pub mod delivery_queue;
pub mod history;
pub mod message;
pub mod message_bus;
pub mod notifier;
pub mod session;
pub mod validation;
