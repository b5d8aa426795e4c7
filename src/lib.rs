//! SurgeGate - A traffic-surge admission controller.
//!
//! # Overview
//!
//! SurgeGate sits in front of a web application and decides, per request,
//! whether to admit it. It keeps one shared aggregate load record (request
//! rate against a moving baseline, plus approximate in-flight requests),
//! decays it lazily from the elapsed time, and applies a threshold policy:
//!
//! - **hard_overload**: the spike ratio reached the hard threshold → reject
//! - **max_concurrent**: too many in-flight requests → reject
//! - **spike_detected**: the spike threshold was crossed → admit with a warning
//!
//! Every failure on the admission path admits the request (fail open).
//!
//! # Modules
//!
//! - [`model`]: Traffic state, config, blocklist rows and decision types
//! - [`decay`]: Time-based decay of the stored counters
//! - [`aggregation`]: Rate, spike ratio and baseline arithmetic
//! - [`policy`]: The threshold decision
//! - [`storage`]: SQLite storage layer
//! - [`blocklist`]: Per-address deny list
//! - [`controller`]: The admission check orchestration
//! - [`interceptor`]: Edge middleware guarding page requests
//! - [`page`]: The rejection page
//! - [`proxy`]: Relay of admitted requests to an upstream origin
//! - [`auth`]: Admin token gate
//! - [`settings`]: Environment configuration
//! - [`error`]: Admin error type
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod auth;
pub mod blocklist;
pub mod controller;
pub mod decay;
pub mod error;
pub mod interceptor;
pub mod model;
pub mod page;
pub mod policy;
pub mod proxy;
pub mod settings;
pub mod storage;
