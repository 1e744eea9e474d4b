//! KV gateway: the persistence seam of the shim.
//!
//! All persistent truth (sandbox records, container records, allocator
//! state) lives in a strongly consistent KV store behind the [`KvStore`]
//! trait. Keys are opaque strings, values are opaque strings, and missing
//! keys are not errors: `get` reports presence, `delete_by_prefix` succeeds
//! on zero matches.
//!
//! Every operation carries a fixed deadline: 3 seconds for point
//! operations, 5 seconds for prefix scans. A blown deadline fails the RPC
//! that issued it but never the process.
//!
//! [`EtcdStore`] is the production implementation, speaking the etcd v3 API
//! with TLS client certificates.

use std::future::Future;
use std::result::Result as StdResult;
use std::time::Duration;

use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, Identity,
    TlsOptions, Txn, TxnOp,
};
use tonic::Status;

use crate::config::EtcdConfig;
use crate::error::{internal, Result};

/// Deadline for point reads, writes and deletes.
const POINT_OP_DEADLINE: Duration = Duration::from_secs(3);
/// Deadline for prefix scans and prefix deletes.
const PREFIX_OP_DEADLINE: Duration = Duration::from_secs(5);

/// Separator between a key prefix and the key proper.
const PREFIX_SEPARATOR: char = '_';

/// Join a prefix and a key into the stored key shape, e.g. `sandbox_<id>`.
pub fn prefixed_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{PREFIX_SEPARATOR}{key}")
}

/// Typed access to the shared KV namespace.
#[tonic::async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read a key. `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under a prefix. Zero matches is success.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<()>;

    /// Values of every key under a prefix, in key order.
    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically replace `key` only if its current value matches `expected`
    /// (`None` = the key must be absent). `value: None` deletes the key.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool>;

    /// Store a value at `prefix_key`.
    async fn put_with_prefix(&self, prefix: &str, key: &str, value: &str) -> Result<()> {
        self.put(&prefixed_key(prefix, key), value).await
    }
}

/// [`KvStore`] over an etcd v3 cluster.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured etcd endpoints with TLS client certs.
    pub async fn connect(conf: &EtcdConfig) -> anyhow::Result<EtcdStore> {
        let ca = tokio::fs::read(&conf.root_cert_path).await?;
        let cert = tokio::fs::read(&conf.client_cert_path).await?;
        let key = tokio::fs::read(&conf.client_key_cert_path).await?;
        let tls = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        let options = ConnectOptions::new()
            .with_tls(tls)
            .with_connect_timeout(Duration::from_secs(5));
        let client = Client::connect(&conf.endpoints, Some(options)).await?;
        Ok(EtcdStore { client })
    }

    async fn with_deadline<T, F>(
        deadline: Duration,
        target: &'static str,
        op: F,
    ) -> Result<T>
    where
        F: Future<Output = StdResult<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(deadline, op).await {
            Ok(result) => result.map_err(internal(target)),
            Err(_elapsed) => Err(Status::deadline_exceeded(target)),
        }
    }
}

#[tonic::async_trait]
impl KvStore for EtcdStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        let put = client.put(key, value, None);
        Self::with_deadline(POINT_OP_DEADLINE, "kv-put-error", put).await?;
        tracing::debug!(key, "kv-put");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let get = client.get(key, None);
        let response = Self::with_deadline(POINT_OP_DEADLINE, "kv-get-error", get).await?;
        match response.kvs().first() {
            Some(kv) => {
                let value = kv.value_str().map_err(internal("kv-get-decode-error"))?;
                Ok(Some(value.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let delete = client.delete(key, None);
        Self::with_deadline(POINT_OP_DEADLINE, "kv-delete-error", delete).await?;
        tracing::debug!(key, "kv-delete");
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        let delete = client.delete(prefix, Some(DeleteOptions::new().with_prefix()));
        let response =
            Self::with_deadline(PREFIX_OP_DEADLINE, "kv-delete-prefix-error", delete).await?;
        tracing::debug!(prefix, deleted = response.deleted(), "kv-delete-prefix");
        Ok(())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let get = client.get(prefix, Some(GetOptions::new().with_prefix()));
        let response =
            Self::with_deadline(PREFIX_OP_DEADLINE, "kv-get-prefix-error", get).await?;
        let mut values = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let value = kv
                .value_str()
                .map_err(internal("kv-get-prefix-decode-error"))?;
            values.push(value.to_string());
        }
        Ok(values)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool> {
        let compare = match expected {
            Some(old) => Compare::value(key, CompareOp::Equal, old),
            // Version 0 means the key has never been written.
            None => Compare::version(key, CompareOp::Equal, 0),
        };
        let operation = match value {
            Some(new) => TxnOp::put(key, new, None),
            None => TxnOp::delete(key, None),
        };
        let txn = Txn::new().when([compare]).and_then([operation]);

        let mut client = self.client.clone();
        let response =
            Self::with_deadline(POINT_OP_DEADLINE, "kv-txn-error", client.txn(txn)).await?;
        Ok(response.succeeded())
    }
}
