//! # ndb-server
//!
//! An HTTP server in front of a retrieval engine, with leader/follower
//! replication through versioned checkpoints in an object store.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────┐  checkpoint   ┌──────────────┐
//!  writes ──▶ │    Leader    │──────────────▶│ Object store │
//!             │ engine + API │   (upload)    │  S3 / local  │
//!             └──────────────┘               └──────┬───────┘
//!                                                   │ adopt latest
//!                                ┌──────────────────┼──────────────┐
//!                                ▼                  ▼              ▼
//!                          ┌──────────┐       ┌──────────┐   ┌──────────┐
//!  reads ────────────────▶ │ Follower │       │ Follower │   │ Follower │
//!                          └──────────┘       └──────────┘   └──────────┘
//! ```
//!
//! The leader accepts inserts, deletes and upvotes, marks its engine dirty,
//! and periodically (or on `POST /checkpoint`) publishes the engine as the
//! next numbered version. Followers serve queries only and poll the store
//! for newer versions.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`object_store`] | Object storage abstraction (S3, local directory) |
//! | [`checkpoint`] | Versioned checkpoint layout, upload, download, retention |
//! | [`state`] | Shared engine, active version, publish and adopt |
//! | [`replication`] | Leader and follower background loops |
//! | [`ingest`] | CSV upload parsing |
//! | [`models`] | API request and response bodies |
//! | [`error`] | API error type and JSON error contract |
//! | [`server`] | HTTP routes |

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod object_store;
pub mod replication;
pub mod server;
pub mod state;
