//! # Bastion Log Watcher
//!
//! One streaming client per managed server, connected to the remote
//! log-watcher agent that tails the game log. The agent speaks
//! newline-delimited JSON over TCP: the client sends a bearer-token hello as
//! its first line, then reads `{event, data, original}` records indefinitely.
//!
//! Records are surfaced as typed [`bastion_events::NormalizedEvent`]s with
//! `source = "log"`. Event names outside the known vocabulary are preserved
//! verbatim and published as-is rather than dropped.
//!
//! On stream error the client waits a fixed 5 seconds and reconnects. There
//! is deliberately no backoff here: the agent is built to tolerate frequent
//! reconnects, and a flat delay keeps recovery latency predictable.

pub mod client;
pub mod records;

pub use client::{LogWatcherClient, LogWatcherConfig, LOG_RECONNECT_DELAY};
pub use records::{parse_record, LogWatchError, WatcherRecord};
