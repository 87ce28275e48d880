//! Session configuration

use crate::error::{Error, Result};
use crate::DEFAULT_BLOCK_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local user name
    pub user: String,

    /// Local provider (mailbox node)
    pub provider: String,

    /// Retransmission policy
    pub arq: ArqPolicy,

    /// Plaintext payload bytes per block
    pub block_payload_len: usize,

    /// Bound for [`wait_for_connection`](crate::Session::wait_for_connection)
    pub connect_timeout: Duration,

    /// Capacity of the transport event channel
    pub event_buffer: usize,

    /// Destination for loop decoys, if any
    pub loop_service: Option<ServiceAddress>,

    /// Periodic decoy driver
    pub cover_traffic: CoverTrafficConfig,

    /// Number of completed inbound message ids remembered for deduplication
    pub completed_cache: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            provider: String::new(),
            arq: ArqPolicy::default(),
            block_payload_len: DEFAULT_BLOCK_PAYLOAD,
            connect_timeout: Duration::from_secs(30),
            event_buffer: 256,
            loop_service: None,
            cover_traffic: CoverTrafficConfig::default(),
            completed_cache: 1024,
        }
    }
}

impl SessionConfig {
    /// Configuration for `user` at `provider` with defaults elsewhere
    #[must_use]
    pub fn new(user: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the session cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::invalid_config("user must not be empty"));
        }
        if self.provider.is_empty() {
            return Err(Error::invalid_config("provider must not be empty"));
        }
        if self.block_payload_len == 0 {
            return Err(Error::invalid_config("block_payload_len must be non-zero"));
        }
        if self.event_buffer == 0 {
            return Err(Error::invalid_config("event_buffer must be non-zero"));
        }
        if self.cover_traffic.enabled {
            if self.loop_service.is_none() {
                return Err(Error::invalid_config(
                    "cover traffic requires a loop service",
                ));
            }
            if self.cover_traffic.mean_interval.is_zero() {
                return Err(Error::invalid_config(
                    "cover traffic mean_interval must be non-zero",
                ));
            }
        }
        self.arq.validate()
    }
}

/// Retransmission timing and budget.
///
/// The retransmission deadline after an attempt is
/// `sent_at + eta * eta_offset + eta * backoff * transmissions`, where
/// `transmissions` includes the attempt just made. With the defaults the
/// waits after the first three attempts are 1.5, 2.5 and 3.5 ETA.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqPolicy {
    /// Total attempts per block, including the first
    pub max_transmissions: u32,

    /// Fixed slack added to every wait, as a multiple of the ETA
    pub eta_offset: f64,

    /// Growth per attempt, as a multiple of the ETA
    pub backoff: f64,
}

impl Default for ArqPolicy {
    fn default() -> Self {
        Self {
            max_transmissions: 3,
            eta_offset: 0.5,
            backoff: 1.0,
        }
    }
}

impl ArqPolicy {
    /// Deadline for the attempt sent at `sent_at` with round-trip estimate `eta`
    #[must_use]
    pub fn deadline(&self, sent_at: Instant, eta: Duration, transmissions: u32) -> Instant {
        let factor = self.eta_offset + self.backoff * f64::from(transmissions);
        sent_at + eta.mul_f64(factor)
    }

    /// When an unacknowledged unreliable block or decoy SURB is given up.
    ///
    /// This is the deadline a reliable block reaches after its last
    /// allowed attempt.
    #[must_use]
    pub fn expiry(&self, sent_at: Instant, eta: Duration) -> Instant {
        self.deadline(sent_at, eta, self.max_transmissions)
    }

    /// Whether another attempt is allowed after `transmissions` attempts
    #[must_use]
    pub fn can_retransmit(&self, transmissions: u32) -> bool {
        transmissions < self.max_transmissions
    }

    /// Validate the policy
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a zero budget or negative or
    /// non-finite multipliers.
    pub fn validate(&self) -> Result<()> {
        if self.max_transmissions == 0 {
            return Err(Error::invalid_config("max_transmissions must be at least 1"));
        }
        if !self.eta_offset.is_finite() || self.eta_offset < 0.0 {
            return Err(Error::invalid_config("eta_offset must be a non-negative number"));
        }
        if !self.backoff.is_finite() || self.backoff < 0.0 {
            return Err(Error::invalid_config("backoff must be a non-negative number"));
        }
        Ok(())
    }
}

/// A `recipient@provider` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    /// User name at the provider
    pub recipient: String,
    /// Provider name
    pub provider: String,
}

impl ServiceAddress {
    /// Build an address
    #[must_use]
    pub fn new(recipient: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            provider: provider.into(),
        }
    }
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.recipient, self.provider)
    }
}

impl std::str::FromStr for ServiceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((recipient, provider)) if !recipient.is_empty() && !provider.is_empty() => {
                Ok(Self::new(recipient, provider))
            }
            _ => Err(Error::invalid_config("address must look like user@provider")),
        }
    }
}

/// Cover traffic configuration
#[derive(Debug, Clone)]
pub struct CoverTrafficConfig {
    /// Enable the periodic loop-decoy driver
    pub enabled: bool,

    /// Mean time between decoys
    pub mean_interval: Duration,

    /// Inter-decoy delay distribution
    pub distribution: CoverTrafficDistribution,
}

impl Default for CoverTrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mean_interval: Duration::from_secs(10),
            distribution: CoverTrafficDistribution::Poisson,
        }
    }
}

/// Cover traffic distribution patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverTrafficDistribution {
    /// Fixed interval
    Constant,
    /// Exponentially distributed intervals
    Poisson,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_deadlines() {
        let arq = ArqPolicy::default();
        let t0 = Instant::now();
        let eta = Duration::from_secs(2);

        assert_eq!(arq.deadline(t0, eta, 1) - t0, Duration::from_secs(3));
        assert_eq!(arq.deadline(t0, eta, 2) - t0, Duration::from_secs(5));
        assert_eq!(arq.deadline(t0, eta, 3) - t0, Duration::from_secs(7));
    }

    #[test]
    fn test_retransmit_budget() {
        let arq = ArqPolicy::default();
        assert!(arq.can_retransmit(1));
        assert!(arq.can_retransmit(2));
        assert!(!arq.can_retransmit(3));
    }

    #[test]
    fn test_expiry_matches_last_deadline() {
        let arq = ArqPolicy::default();
        let t0 = Instant::now();
        let eta = Duration::from_secs(2);
        assert_eq!(arq.expiry(t0, eta), arq.deadline(t0, eta, 3));
        assert_eq!(arq.expiry(t0, eta) - t0, Duration::from_secs(7));
    }

    #[test]
    fn test_arq_validate() {
        assert!(ArqPolicy::default().validate().is_ok());
        let zero = ArqPolicy {
            max_transmissions: 0,
            ..ArqPolicy::default()
        };
        assert!(zero.validate().is_err());
        let nan = ArqPolicy {
            backoff: f64::NAN,
            ..ArqPolicy::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_session_config_validate() {
        assert!(SessionConfig::default().validate().is_err());
        let config = SessionConfig::new("alice", "acme.net");
        assert!(config.validate().is_ok());

        let mut cover = config.clone();
        cover.cover_traffic.enabled = true;
        assert!(cover.validate().is_err());
        cover.loop_service = Some(ServiceAddress::new("loop", "acme.net"));
        assert!(cover.validate().is_ok());
    }

    #[test]
    fn test_service_address_parse() {
        let addr: ServiceAddress = "loop@acme.net".parse().unwrap();
        assert_eq!(addr, ServiceAddress::new("loop", "acme.net"));
        assert_eq!(addr.to_string(), "loop@acme.net");
        assert!("nobody".parse::<ServiceAddress>().is_err());
        assert!("@acme.net".parse::<ServiceAddress>().is_err());
    }
}
