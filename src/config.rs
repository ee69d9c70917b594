use std::{net::SocketAddr, path::PathBuf, time::Duration};

use typed_builder::TypedBuilder;

use crate::net::DEFAULT_PORT;

/// Scheduling knobs for a [`Client`](crate::Client).
#[derive(Clone, Debug, TypedBuilder)]
pub struct BoardConfig {
    /// Whether the master executes ready tasks itself. Ignored while no
    /// workers have joined.
    #[builder(default = true)]
    pub master_works: bool,
    /// How long a worker backs off when it is waiting on results and there is
    /// nothing ready for it to steal.
    #[builder(default = Duration::from_millis(2))]
    pub poll_interval: Duration,
    /// How long the master waits for an inbound request before re-checking
    /// its own state.
    #[builder(default = Duration::from_millis(20))]
    pub handle_timeout: Duration,
    /// Give up with [`Error::Stalled`](crate::Error::Stalled) once the master
    /// has waited this long in a row without hearing from anyone.
    #[builder(default, setter(strip_option))]
    pub stall_after: Option<Duration>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where and how participants meet over the network.
#[derive(Clone, Debug, TypedBuilder)]
pub struct NetConfig {
    /// The master listens here and workers connect here.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    pub addr: SocketAddr,
    /// TLS server name presented by the master.
    #[builder(default = "bulletin".into(), setter(into))]
    pub server_name: String,
    /// PEM certificate chain for the master. A self-signed certificate is
    /// generated when this is unset.
    #[builder(default, setter(strip_option, into))]
    pub cert_chain: Option<PathBuf>,
    /// PEM PKCS#8 private key matching `cert_chain`.
    #[builder(default, setter(strip_option, into))]
    pub private_key: Option<PathBuf>,
    #[builder(default = Duration::from_secs(5))]
    pub keep_alive: Duration,
    /// How long closing waits for peers to acknowledge what was already sent.
    #[builder(default = Duration::from_secs(5))]
    pub close_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
