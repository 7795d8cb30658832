use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterClient, PoolConfig, RetryPolicy, ScanConfig};
use crate::core::connection::{Connector, TcpConnector};
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 6379;

/// Everything a [`ClusterClient`] needs to run.
#[derive(Clone)]
#[non_exhaustive]
pub struct ClusterConfig {
    /// Bootstrap nodes as `host:port`.
    pub seeds: Vec<String>,
    /// Retry budget and backoff.
    pub retry: RetryPolicy,
    /// Per-node pool settings.
    pub pool: PoolConfig,
    /// Scan behavior on topology changes.
    pub scan: ScanConfig,
    /// Overall deadline for one `execute` call. `None` means no deadline.
    pub command_timeout: Option<Duration>,
    /// Route read-only commands to replicas when the slot has any.
    pub read_from_replicas: bool,
    /// How node connections are opened.
    pub connector: Arc<dyn Connector>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("seeds", &self.seeds)
            .field("retry", &self.retry)
            .field("pool", &self.pool)
            .field("scan", &self.scan)
            .field("command_timeout", &self.command_timeout)
            .field("read_from_replicas", &self.read_from_replicas)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating a [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotwise::ClusterClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClusterClientBuilder::new()
///     .seed("127.0.0.1:7000")
///     .seed("redis://127.0.0.1:7001")
///     .max_attempts(5)
///     .command_timeout(Some(Duration::from_secs(2)))
///     .read_from_replicas(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ClusterClientBuilder {
    seeds: Vec<String>,
    retry: RetryPolicy,
    pool: PoolConfig,
    scan: ScanConfig,
    command_timeout: Option<Option<Duration>>,
    connect_timeout: Option<Duration>,
    read_from_replicas: bool,
    connector: Option<Arc<dyn Connector>>,
}

impl ClusterClientBuilder {
    /// Creates a new [`ClusterClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed node, as `host:port` or `redis://host:port`.
    #[inline]
    pub fn seed(mut self, address: impl Into<String>) -> Self {
        self.seeds.push(address.into());
        self
    }

    /// Adds several seed nodes.
    #[inline]
    pub fn seeds<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Sets the total number of dispatches allowed per command (at least 1).
    #[inline]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff used before retrying TRYAGAIN and CLUSTERDOWN.
    ///
    /// The delay doubles per attempt, starting at `base` and capped at `max`.
    #[inline]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry.base_backoff = base;
        self.retry.max_backoff = max.max(base);
        self
    }

    /// Chooses whether a MOVED redirection consumes a retry attempt.
    #[inline]
    pub fn moved_consumes_attempt(mut self, consumes: bool) -> Self {
        self.retry.moved_consumes_attempt = consumes;
        self
    }

    /// Sets the overall deadline for a single command. `None` disables it.
    #[inline]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the TCP connect timeout for the default connector.
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Serves read-only commands from replicas when available.
    #[inline]
    pub fn read_from_replicas(mut self, enabled: bool) -> Self {
        self.read_from_replicas = enabled;
        self
    }

    /// Allows up to `max` concurrent connections per node (default 1).
    #[inline]
    pub fn max_connections_per_node(mut self, max: usize) -> Self {
        self.pool.max_connections_per_node = max.max(1);
        self
    }

    /// Re-scans the slots of a node that vanished mid-scan on their new owner.
    #[inline]
    pub fn rescan_on_failover(mut self, enabled: bool) -> Self {
        self.scan.rescan_on_failover = enabled;
        self
    }

    /// Replaces the TCP connector, e.g. with an in-memory one for tests.
    #[inline]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validates the settings without connecting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no seed is given or a seed is malformed.
    pub fn into_config(self) -> Result<ClusterConfig> {
        let seeds = self
            .seeds
            .iter()
            .map(|s| parse_seed(s))
            .collect::<Result<Vec<_>>>()?;
        if seeds.is_empty() {
            return Err(Error::InvalidArgument {
                message: "no valid addresses provided".to_string(),
            });
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.connect_timeout)));

        Ok(ClusterConfig {
            seeds,
            retry: self.retry,
            pool: self.pool,
            scan: self.scan,
            command_timeout: self
                .command_timeout
                .unwrap_or(Some(Duration::from_secs(5))),
            read_from_replicas: self.read_from_replicas,
            connector,
        })
    }

    /// Builds the client and bootstraps the topology from the seeds.
    ///
    /// # Errors
    ///
    /// Returns `TopologyUnavailable` if no seed answers, or `InvalidArgument`
    /// for bad settings.
    pub async fn build(self) -> Result<ClusterClient> {
        let client = ClusterClient::with_config(self.into_config()?);
        client.refresh_topology().await?;
        Ok(client)
    }

    /// Builds the client without contacting any node.
    ///
    /// The topology is fetched by the first command that needs it.
    pub fn build_lazy(self) -> Result<ClusterClient> {
        Ok(ClusterClient::with_config(self.into_config()?))
    }
}

/// Normalizes a seed to `host:port`.
pub(crate) fn parse_seed(seed: &str) -> Result<String> {
    let seed = seed.trim();
    let with_scheme = if seed.contains("://") {
        seed.to_string()
    } else {
        format!("redis://{}", seed)
    };

    let parsed = url::Url::parse(&with_scheme).map_err(|_| Error::InvalidArgument {
        message: format!("invalid address format: {}", seed),
    })?;

    if parsed.scheme() != "redis" {
        return Err(Error::InvalidArgument {
            message: "invalid scheme, expected redis://".to_string(),
        });
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidArgument {
            message: "missing host in address".to_string(),
        })?;

    Ok(format!("{}:{}", host, parsed.port().unwrap_or(DEFAULT_PORT)))
}
