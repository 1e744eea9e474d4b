//! Sandbox IP address management.
//!
//! Addresses are handed out of a configured CIDR and tracked in three KV
//! keys shared by every node:
//!
//! - `ipRanges`: the CIDR itself, written once at startup.
//! - `latestIp`: the high-water mark of sequentially issued addresses.
//! - `releasedIp`: a JSON-encoded set of returned addresses awaiting reuse.
//!
//! Allocation prefers the released set, popping its smallest member;
//! otherwise it bumps the high-water mark, bootstrapping from `<base>.1` on
//! first use. Releasing inserts unconditionally.
//!
//! The three keys are shared across nodes without any other coordination, so
//! every mutation here goes through a compare-and-swap on the key it read;
//! a lost race re-reads and retries. This is what keeps an address from
//! being owned by two sandboxes at once.

use std::collections::BTreeSet;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tonic::Status;

use crate::error::{internal, Result};
use crate::store::KvStore;

const IP_RANGES_KEY: &str = "ipRanges";
const LATEST_IP_KEY: &str = "latestIp";
const RELEASED_IP_KEY: &str = "releasedIp";

/// Give up after this many lost compare-and-swap races.
const MAX_ALLOCATION_RETRIES: usize = 32;

/// Exclusive allocator over the shared CIDR.
pub struct IpAllocator {
    db: Arc<dyn KvStore>,
}

impl IpAllocator {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        IpAllocator { db }
    }

    /// Validate and persist the allocator CIDR. Called once at startup.
    pub async fn init_ip_range(&self, cidr: &str) -> Result<()> {
        if !is_valid_cidr(cidr) {
            return Err(Status::invalid_argument(format!(
                "invalid ip range {cidr:?}, expected a.b.c.d/n"
            )));
        }
        self.db.put(IP_RANGES_KEY, cidr).await
    }

    /// Allocate the next sandbox address.
    pub async fn new_sandbox_ip(&self) -> Result<String> {
        for _ in 0..MAX_ALLOCATION_RETRIES {
            // A returned address is always preferred over growing the range.
            let released = self.db.get(RELEASED_IP_KEY).await?;
            if let Some(raw) = released.as_deref() {
                let mut set = decode_released(raw)?;
                if let Some(ip) = set.iter().next().cloned() {
                    set.remove(&ip);
                    let replacement = if set.is_empty() {
                        None
                    } else {
                        Some(encode_released(&set)?)
                    };
                    if self
                        .db
                        .compare_and_swap(RELEASED_IP_KEY, Some(raw), replacement.as_deref())
                        .await?
                    {
                        return Ok(ip);
                    }
                    continue;
                }
            }

            let latest = self.db.get(LATEST_IP_KEY).await?;
            let ip = match latest.as_deref() {
                Some(last) => next_ip(last)?,
                None => {
                    let ranges = self.db.get(IP_RANGES_KEY).await?.ok_or_else(|| {
                        Status::failed_precondition("ip range is not initialised")
                    })?;
                    first_ip(&ranges)?
                }
            };
            if self
                .db
                .compare_and_swap(LATEST_IP_KEY, latest.as_deref(), Some(&ip))
                .await?
            {
                return Ok(ip);
            }
        }
        Err(Status::aborted("ip-allocation-conflict"))
    }

    /// Return an address to the released set.
    ///
    /// The insert is unconditional: the allocator does not check whether it
    /// ever issued the address.
    pub async fn put_released_ip(&self, ip: &str) -> Result<()> {
        for _ in 0..MAX_ALLOCATION_RETRIES {
            let current = self.db.get(RELEASED_IP_KEY).await?;
            let mut set = match current.as_deref() {
                Some(raw) => decode_released(raw)?,
                None => BTreeSet::new(),
            };
            set.insert(ip.to_string());
            let encoded = encode_released(&set)?;
            if self
                .db
                .compare_and_swap(RELEASED_IP_KEY, current.as_deref(), Some(&encoded))
                .await?
            {
                return Ok(());
            }
        }
        Err(Status::aborted("ip-release-conflict"))
    }
}

fn decode_released(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(raw).map_err(internal("released-ip-decode-error"))
}

fn encode_released(set: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(set).map_err(internal("released-ip-encode-error"))
}

lazy_static! {
    static ref CIDR_RE: Regex = Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})/(\d{1,2})$").unwrap();
}

fn is_valid_cidr(cidr: &str) -> bool {
    match CIDR_RE.captures(cidr) {
        Some(captures) => (1..=4)
            .all(|i| captures[i].parse::<u32>().is_ok_and(|octet| octet <= 255))
            && captures[5].parse::<u32>().is_ok_and(|mask| mask <= 32),
        None => false,
    }
}

/// The address after `last`, bumping the fourth octet.
///
/// Walking past 255 does not spill into the third octet; the pool is simply
/// exhausted at that point.
fn next_ip(last: &str) -> Result<String> {
    let octets: Vec<&str> = last.split('.').collect();
    if octets.len() != 4 {
        return Err(Status::internal(format!("malformed latest ip {last:?}")));
    }
    let tail: u32 = octets[3]
        .parse()
        .map_err(internal("latest-ip-parse-error"))?;
    if tail >= 255 {
        return Err(Status::resource_exhausted(format!(
            "ip pool exhausted at {last}"
        )));
    }
    Ok(format!(
        "{}.{}.{}.{}",
        octets[0],
        octets[1],
        octets[2],
        tail + 1
    ))
}

/// The first address of a CIDR: base octets with the fourth forced to 1.
fn first_ip(cidr: &str) -> Result<String> {
    if !is_valid_cidr(cidr) {
        return Err(Status::internal(format!("malformed ip range {cidr:?}")));
    }
    let base = cidr.split('/').next().unwrap_or_default();
    let octets: Vec<&str> = base.split('.').collect();
    Ok(format!("{}.{}.{}.1", octets[0], octets[1], octets[2]))
}
