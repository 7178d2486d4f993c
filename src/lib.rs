//! # Search Relay
//!
//! Search-augmented generation where the search runs out-of-band and its
//! result travels back over a publish/subscribe topic.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──▶ Augmentor ──▶ Trigger ──▶ search provider
//!                │                          │
//!                │                          ▼
//!                │                   BrokerClient::publish ──▶ topic
//!                │                                               │
//!                ▼                                               ▼
//!           Correlator ◀── per-id slots ◀── reader task ◀── read cursor
//!                │
//!                ▼
//!        augmented prompt ──▶ Generator ──▶ chunks ──▶ caller
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! relay serve                    # ingress service on [server].bind
//! relay ask "weather in Paris"   # augmented generation, streamed to stdout
//! relay serve --memory           # local run without an AMQP broker
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the topic message schema |
//! | [`error`] | Error taxonomy |
//! | [`broker`] | Broker client: durable publish, shared read cursor |
//! | [`amqp`] | AMQP transport |
//! | [`limiter`] | Token-bucket admission gate |
//! | [`search`] | External search provider |
//! | [`trigger`] | Search trigger (in-process and remote) |
//! | [`correlator`] | Deadline-bounded result correlation |
//! | [`augment`] | Generation augmentor |
//! | [`generate`] | Ollama-compatible streaming generator |
//! | [`server`] | Ingress HTTP server |
//! | [`shutdown`] | Shutdown coordination |
//! | [`logging`] | Tracing subscriber setup |

pub mod amqp;
pub mod augment;
pub mod broker;
pub mod config;
pub mod correlator;
pub mod error;
pub mod generate;
pub mod limiter;
pub mod logging;
pub mod models;
pub mod search;
pub mod server;
pub mod shutdown;
pub mod trigger;
