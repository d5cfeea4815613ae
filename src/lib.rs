//! Mimic Proxy - a transparent HTTP reverse proxy
//!
//! The proxy sits between clients and upstream HTTP(S) services and aims for
//! perfect transparency: it strips proxy-identifying headers, injects
//! credentials from the environment, rewrites paths per route, and can
//! intercept redirect responses so that a redirect chain stays on-proxy.

pub mod error;
pub mod proxy;
pub mod settings;

pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyConfig};
