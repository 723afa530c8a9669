//! Photo detection pipeline
//!
//! A chat gateway turns photos into jobs on a Redis queue; workers download
//! each image, run object detection, upload the annotated image, persist a
//! prediction record in PostgreSQL and call the gateway back so it can reply
//! with the results.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
