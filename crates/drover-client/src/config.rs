//! Client tuning, fixed at construction. Nothing here is process-global;
//! two clients in one process can carry different settings.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How a [`crate::Client`] connects and paces itself.
///
/// `touch_interval` must stay strictly below the server's reservation
/// time-to-run or reserved jobs will be auto-released mid-execution.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// host:port of the server.
    pub addr: String,
    /// Name expected on the server's TLS certificate.
    pub server_name: String,
    /// Pinned CA certificate bundle; webpki roots are trusted when unset.
    pub ca_file: Option<PathBuf>,
    /// Authentication token attached to every request.
    pub token: Vec<u8>,
    /// Connect timeout and per-request receive deadline.
    pub timeout: Duration,
    /// Shell used to run job commands; must support `set -o pipefail`.
    pub shell: String,
    pub touch_interval: Duration,
    /// Delay the server applies before a released job becomes ready again.
    pub release_delay: Duration,
    /// Floor, in MiB, for any RAM bump applied when a job dies of memory.
    pub ram_increase_min: u64,
    /// Multiplier applied to a memory-killed job's RAM requirement when it
    /// is below `ram_increase_breakpoint` MiB...
    pub ram_increase_mult_low: f64,
    /// ...and when it is at or above the breakpoint.
    pub ram_increase_mult_high: f64,
    pub ram_increase_breakpoint: u64,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, server_name: impl Into<String>, token: Vec<u8>) -> Self {
        ClientConfig {
            addr: addr.into(),
            server_name: server_name.into(),
            ca_file: None,
            token,
            timeout: Duration::from_secs(30),
            shell: "bash".to_string(),
            touch_interval: Duration::from_secs(15),
            release_delay: Duration::from_secs(30),
            ram_increase_min: 1000,
            ram_increase_mult_low: 2.0,
            ram_increase_mult_high: 1.3,
            ram_increase_breakpoint: 8192,
        }
    }

    /// The RAM requirement to ask for next after `current` MiB proved
    /// insufficient.
    pub fn next_ram(&self, current: u64) -> u64 {
        let mult = if current < self.ram_increase_breakpoint {
            self.ram_increase_mult_low
        } else {
            self.ram_increase_mult_high
        };
        let multiplied = (current as f64 * mult).ceil() as u64;
        multiplied.max(current + self.ram_increase_min)
    }
}
