//! Egress proxy management.

pub mod endpoint;
pub mod pool;

pub use endpoint::{
    ProxyAddress, ProxyEndpoint, ProxyHealth, ProxyTier, parse_proxy_line, parse_proxy_list,
};
pub use pool::{CallGuard, ProxyLease, ProxyPool};
