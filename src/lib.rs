//! Per-interface bandwidth monitor: sysfs counter sampling, a
//! minute/hour/day/month bucket store, and a live sample feed.

pub mod agent;
pub mod config;
pub mod db;
pub mod iface;
pub mod live;
pub mod sample;
pub mod web;
