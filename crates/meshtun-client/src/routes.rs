//! Route manifest download and installation
//!
//! The manifest is plain text with one destination per line. Lines are
//! handed to the configurator as-is.

use crate::netconfig::NetworkConfigurator;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Failed to download route manifest: {0}")]
    Download(#[from] reqwest::Error),
}

pub fn parse_routes(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn fetch_routes(client: &reqwest::Client, url: &str) -> Result<Vec<String>, RouteError> {
    info!("Downloading route manifest from {}", url);
    let manifest = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_routes(&manifest))
}

/// Install every route, returning how many succeeded
pub async fn apply_routes(
    configurator: &dyn NetworkConfigurator,
    routes: &[String],
    name: &str,
    ip: &str,
    gateway: &str,
) -> usize {
    let mut installed = 0;
    for route in routes {
        match configurator.add_route(route, name, ip, gateway).await {
            Ok(()) => {
                debug!("Added route {} via {}", route, name);
                installed += 1;
            }
            Err(e) => warn!("Failed to add route {}: {}", route, e),
        }
    }
    info!("Installed {}/{} routes", installed, routes.len());
    installed
}
