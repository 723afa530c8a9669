pub mod bot;
pub mod chat;
pub mod detection;
pub mod notifier;
pub mod queue;
pub mod records;
pub mod results;
pub mod storage;
