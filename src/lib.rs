//! Epigram - A Topic News Aggregator
//!
//! This crate keeps per-topic buckets of extracted articles fresh, serves
//! merged feeds from them, and streams AI-written briefings of a story's
//! sources with memoization and per-client rate limiting.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod insight;
pub mod llm;
pub mod models;
pub mod populate;
pub mod ratelimit;
pub mod routes;
pub mod sse;
pub mod store;
