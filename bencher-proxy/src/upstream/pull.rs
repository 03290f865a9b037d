//! Polling transport for HTTP pools and wallets.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;
use crate::types::{MinerRound, MiningInfo, MiningInfoWire};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP upstream, polled for mining info and POSTed nonce submissions.
pub struct PullUpstream {
    http: reqwest::Client,
    base_url: String,
    account_key: String,
    /// Per-chain passphrase override; empty means "pass the miner's own
    /// phrase through, if any".
    passphrase: String,
    ip_forwarding: bool,
    miner_alias: String,
}

impl PullUpstream {
    pub fn new(
        base_url: String,
        account_key: String,
        passphrase: String,
        ip_forwarding: bool,
        miner_alias: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            account_key,
            passphrase,
            ip_forwarding,
            miner_alias,
        })
    }

    /// `GET <url>/burst?requestType=getMiningInfo`
    pub async fn fetch_mining_info(&self, total_capacity: i64) -> Result<MiningInfo> {
        let url = format!("{}/burst?requestType=getMiningInfo", self.base_url);
        let tag = product_tag();
        let wire: MiningInfoWire = self
            .http
            .get(&url)
            .header("User-Agent", &tag)
            .header("X-Miner", &tag)
            .header("X-Capacity", total_capacity.to_string())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(MiningInfo::from(wire))
    }

    /// `POST <url>/burst?requestType=submitNonce&...`, returning the
    /// response body verbatim.
    pub async fn submit(
        &self,
        round: &MinerRound,
        miner: &str,
        peer_ip: IpAddr,
        total_capacity: i64,
    ) -> Result<Vec<u8>> {
        let query = encode_query(&build_submit_query(round, &self.passphrase));
        let url = format!("{}/burst?requestType=submitNonce&{}", self.base_url, query);
        let tag = miner_tag(miner);

        let mut request = self
            .http
            .post(&url)
            .header("User-Agent", &tag)
            .header("X-Miner", &tag)
            .header("X-MinerAlias", &self.miner_alias)
            .header("X-Capacity", total_capacity.to_string())
            .header("X-Account", &self.account_key);
        if self.ip_forwarding {
            request = request.header("X-Forwarded-For", peer_ip.to_string());
        }

        let response = request.send().await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Product tag sent upstream on refresh requests.
fn product_tag() -> String {
    format!("BencherProxy/{}", crate::VERSION)
}

/// Product tag extended with the submitting miner's own software name.
fn miner_tag(miner: &str) -> String {
    format!("BencherProxy/{}/{}", crate::VERSION, miner)
}

/// Build the submitNonce form pairs for `round`.
///
/// `deadline` is omitted when the miner pre-adjusted it (the raw value is
/// meaningless upstream) and in wallet mode (a passphrase is attached and
/// the wallet recomputes the deadline itself). `secretPhrase` is omitted
/// when empty (pool mode).
pub(crate) fn build_submit_query(
    round: &MinerRound,
    passphrase_override: &str,
) -> Vec<(&'static str, String)> {
    let mut passphrase = round.passphrase.clone().unwrap_or_default();
    if !passphrase_override.is_empty() {
        passphrase = passphrase_override.to_string();
    }

    let mut pairs = vec![
        ("accountId", round.account_id.to_string()),
        ("blockheight", round.height.to_string()),
        ("deadline", round.deadline.to_string()),
        ("nonce", round.nonce.to_string()),
        ("secretPhrase", passphrase.clone()),
    ];

    if round.adjusted {
        pairs.retain(|(key, _)| *key != "deadline");
    }
    if passphrase.is_empty() {
        pairs.retain(|(key, _)| *key != "secretPhrase");
    } else {
        pairs.retain(|(key, _)| *key != "deadline");
    }
    pairs
}

pub(crate) fn encode_query(pairs: &[(&'static str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}
