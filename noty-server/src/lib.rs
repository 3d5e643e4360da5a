//! Multi-node notification and workflow delivery service.

pub mod catalog;
pub mod config;
pub mod directory;
pub mod election;
pub mod error;
pub mod health;
pub mod mail;
pub mod notify;
pub mod pb;
pub mod pubsub;
pub mod server;
pub mod session;
pub mod taskqueue;
pub mod template;
pub mod web;
pub mod wire;
pub mod workflow;
