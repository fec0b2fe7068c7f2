//! Endpoints published by background services

use std::collections::BTreeMap;

use serde::Serialize;

/// Addresses of one exposed service port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointMapping {
    /// Address on the service network
    pub internal: String,
    /// Address reachable from the host
    pub external: String,
}

/// Container port -> endpoint addresses
pub type EndpointMappings = BTreeMap<u16, EndpointMapping>;
