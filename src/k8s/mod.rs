pub mod cache;
pub mod client;
pub mod cluster;
pub mod discovery;
pub mod object;

/// Default user agent for `kubemirror` - automatically uses the package version
///
/// Can be overridden at runtime via the `KUBEMIRROR_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Environment variable overriding [`USER_AGENT`]
pub const USER_AGENT_ENV: &str = "KUBEMIRROR_USER_AGENT";
