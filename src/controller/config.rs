use std::{env, path::PathBuf, str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use super::fanout::{
    error::Error, TopicId, DEFAULT_SUBSCRIBER_PORT, DEFAULT_TOPIC, FIRST_TIER_PORT,
};

/// Everything the controller daemon needs to know. Defaults match the
/// reference deployment; `from_env` applies `PS_*` overrides on top.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct ControllerConfig {
    /// Namespace the subscriber pods run in.
    #[builder(default = String::from("psbench"), setter(into))]
    pub namespace: String,
    #[builder(default = String::from("app=subscriber"), setter(into))]
    pub subscriber_selector: String,
    /// Label carrying a subscriber's topic id.
    #[builder(default = String::from("ps/topic"), setter(into))]
    pub topic_label: String,
    /// Container environment variable carrying a subscriber's UDP port.
    #[builder(default = String::from("PS_UDP_PORT"), setter(into))]
    pub port_env: String,
    #[builder(default = DEFAULT_TOPIC)]
    pub default_topic: TopicId,
    #[builder(default = DEFAULT_SUBSCRIBER_PORT)]
    pub default_port: u16,
    #[builder(default = FIRST_TIER_PORT)]
    pub first_tier_port: u16,
    /// Route handle stamped on every local subscriber destination. 0 lets the
    /// forwarder fall back to its own configured interface.
    #[builder(default = 0)]
    pub local_route_ifindex: u32,
    /// bpffs directory the forwarder's maps are pinned under.
    #[builder(default = PathBuf::from("/sys/fs/bpf/psbench"), setter(into))]
    pub pin_root: PathBuf,
    #[builder(default = Duration::from_secs(5))]
    pub reconcile_interval: Duration,
    /// Upper bound on each inventory call.
    #[builder(default = Duration::from_secs(10))]
    pub discovery_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={value:?} is not valid")))
}

impl ControllerConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Applies overrides from an arbitrary key lookup and validates the
    /// result.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(v) = lookup("PS_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = lookup("PS_SUBSCRIBER_SELECTOR") {
            config.subscriber_selector = v;
        }
        if let Some(v) = lookup("PS_PIN_ROOT") {
            config.pin_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PS_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval =
                Duration::from_secs(parse_var("PS_RECONCILE_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("PS_DISCOVERY_TIMEOUT_SECS") {
            config.discovery_timeout =
                Duration::from_secs(parse_var("PS_DISCOVERY_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("PS_LOCAL_ROUTE_IFINDEX") {
            config.local_route_ifindex = parse_var("PS_LOCAL_ROUTE_IFINDEX", &v)?;
        }
        if let Some(v) = lookup("PS_FIRST_TIER_PORT") {
            config.first_tier_port = parse_var("PS_FIRST_TIER_PORT", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace cannot be empty".into()));
        }
        if self.reconcile_interval.is_zero() {
            return Err(Error::Config("reconcile interval must be non-zero".into()));
        }
        if self.discovery_timeout.is_zero() {
            return Err(Error::Config("discovery timeout must be non-zero".into()));
        }
        if self.first_tier_port == 0 || self.default_port == 0 {
            return Err(Error::Config("ports must be non-zero".into()));
        }
        Ok(())
    }
}
