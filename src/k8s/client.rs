// Client creation with custom user-agent support for kube 2.x
use super::{USER_AGENT, USER_AGENT_ENV};
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::{debug, warn};

/// User agent to send: explicit value, then `KUBEMIRROR_USER_AGENT`, then the crate default
#[must_use]
pub fn resolve_user_agent(custom_user_agent: Option<&str>) -> String {
    custom_user_agent
        .map(str::to_string)
        .or_else(|| std::env::var(USER_AGENT_ENV).ok().filter(|ua| !ua.is_empty()))
        .unwrap_or_else(|| USER_AGENT.to_string())
}

/// Create a new k8s client from the inferred kubeconfig
///
/// An unusable user agent is logged and the kube default is kept.
///
/// # Errors
///
/// Will return `Err` if no kubeconfig or in-cluster config can be loaded
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;
    let user_agent = resolve_user_agent(custom_user_agent);

    match HeaderValue::from_str(&user_agent) {
        Ok(value) => {
            debug!("Using user agent {}", user_agent);
            config
                .headers
                .push((HeaderName::from_static("user-agent"), value));
        }
        Err(e) => warn!("Ignoring invalid user agent {:?}: {}", user_agent, e),
    }

    Ok(Client::try_from(config)?)
}
