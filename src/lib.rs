//! mirage-ecs - on-demand review environments behind a virtual-host proxy
//!
//! This library provides a review-environment controller that:
//! - Launches container tasks on demand through a pluggable task runner
//! - Routes HTTP traffic to tasks by the first label of the Host header
//! - Counts accesses per subdomain and reports them to a metrics sink
//! - Purges subdomains that received no traffic within a window
//! - Synchronizes DNS records for discovered task addresses
//! - Guards the management UI with token, cookie, OIDC, and basic auth

pub mod access_counter;
pub mod auth;
pub mod config;
pub mod dns;
pub mod local;
pub mod pool;
pub mod proxy;
pub mod purge;
pub mod server;
pub mod sync;
pub mod task;
pub mod types;
pub mod webapi;
