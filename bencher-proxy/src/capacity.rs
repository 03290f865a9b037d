//! Registry of recently-seen miners and the total-capacity beacon.
//!
//! Every `getMiningInfo` request refreshes the caller's entry from its
//! request headers; entries fall out after a minute of silence. The summed
//! capacity is attached to outgoing upstream requests and rendered by the
//! stats listener.

use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::Serialize;

use crate::cache::TtlCache;
use crate::tracing::prelude::*;

const CLIENT_TTL: Duration = Duration::from_secs(60);

/// Stable identity of one miner process, as registered via headers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClientId {
    ip: String,
    port: String,
    #[serde(rename = "minerName")]
    miner_name: String,
    xpu: String,
}

/// One miner's declared inventory.
#[derive(Debug, Clone)]
pub struct ClientData {
    id: ClientId,
    alias: String,
    capacity_gib: i64,
}

fn fingerprint(id: &ClientId) -> String {
    let canonical = serde_json::to_vec(id).expect("client id serializes");
    hex::encode(Md5::digest(&canonical))
}

/// All miners seen in the last minute, keyed by identity fingerprint.
pub struct ClientRegistry {
    clients: TtlCache<Arc<ClientData>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: TtlCache::new(CLIENT_TTL),
        }
    }

    /// Refresh the caller's entry. The key is a fingerprint of the identity
    /// fields, so repeated updates with unchanged inputs land on the same
    /// entry.
    pub fn update(
        &self,
        ip: &str,
        port: &str,
        miner_name: &str,
        alias: &str,
        xpu: &str,
        capacity_gib: i64,
    ) {
        let id = ClientId {
            ip: ip.to_string(),
            port: port.to_string(),
            miner_name: miner_name.to_string(),
            xpu: xpu.to_string(),
        };
        let key = fingerprint(&id);
        self.clients.insert(
            key,
            Arc::new(ClientData {
                id,
                alias: alias.to_string(),
                capacity_gib,
            }),
        );
    }

    /// Sum of declared capacities (GiB) over non-expired miners.
    pub fn total_capacity(&self) -> i64 {
        self.clients
            .snapshot()
            .iter()
            .map(|(_, miner)| miner.capacity_gib)
            .sum()
    }

    /// Plain-text miner table for the stats listener. Empty when nobody is
    /// mining.
    pub fn render_stats(&self) -> String {
        let miners = self.clients.snapshot();
        if miners.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        for (key, miner) in &miners {
            let hashrate =
                miner.capacity_gib as f64 / 240.0 / 1000.0 / 1000.0 * 8192.0 * 4.0 * 1024.0;
            out.push_str(&format!(
                "Miner: {} {} {} {:.2}MH/s {:.2}GiB {}\n",
                key, miner.alias, miner.id.miner_name, hashrate, miner.capacity_gib as f64,
                miner.id.xpu,
            ));
        }
        out.push('\n');
        out.push_str(&format!(
            "Total Capacity: {:.5} TiB",
            self.total_capacity() as f64 / 1024.0
        ));
        out
    }

    /// Log the miner table, one line per miner (block-transition display).
    pub fn log_miners(&self) {
        let miners = self.clients.snapshot();
        if miners.is_empty() {
            return;
        }
        for (key, miner) in &miners {
            info!(
                "Miner: {} {} {} {:.5} TiB",
                key,
                miner.id.ip,
                miner.id.miner_name,
                miner.capacity_gib as f64 / 1024.0
            );
        }
        info!(
            "Total Capacity: {:.5} TiB",
            self.total_capacity() as f64 / 1024.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_idempotent_for_unchanged_identity() {
        let registry = ClientRegistry::new();
        registry.update("1.1.1.1", "4711", "scavenger", "rig", "CPU", 100);
        registry.update("1.1.1.1", "4711", "scavenger", "rig", "CPU", 100);

        assert_eq!(registry.clients.snapshot().len(), 1);
        assert_eq!(registry.total_capacity(), 100);
    }

    #[test]
    fn test_capacity_update_keeps_single_entry() {
        let registry = ClientRegistry::new();
        registry.update("1.1.1.1", "4711", "scavenger", "rig", "CPU", 100);
        registry.update("1.1.1.1", "4711", "scavenger", "rig", "CPU", 250);

        assert_eq!(registry.total_capacity(), 250);
    }

    #[test]
    fn test_distinct_identities_sum() {
        let registry = ClientRegistry::new();
        registry.update("1.1.1.1", "4711", "scavenger", "a", "CPU", 100);
        registry.update("1.1.1.2", "4711", "scavenger", "b", "GPU", 50);
        registry.update("1.1.1.1", "4712", "scavenger", "a", "CPU", 25);

        assert_eq!(registry.total_capacity(), 175);
    }

    #[test]
    fn test_fingerprint_is_stable_hex_md5() {
        let id = ClientId {
            ip: "1.1.1.1".to_string(),
            port: "4711".to_string(),
            miner_name: "scavenger".to_string(),
            xpu: "CPU".to_string(),
        };

        let first = fingerprint(&id);
        let second = fingerprint(&id);

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stats_rendering() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.render_stats(), "");

        registry.update("1.1.1.1", "4711", "scavenger", "rig", "CPU", 1024);
        let stats = registry.render_stats();

        assert!(stats.contains("scavenger"));
        assert!(stats.contains("1024.00GiB"));
        assert!(stats.ends_with("Total Capacity: 1.00000 TiB"));
    }
}
