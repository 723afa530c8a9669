pub mod chat;
pub mod job;
pub mod label;
pub mod prediction;
