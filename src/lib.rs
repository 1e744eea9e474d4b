//! sobeyshim: a node-local container runtime shim.
//!
//! A kubelet speaks the Container Runtime Interface to this process over a
//! Unix-domain gRPC socket; the shim materialises pod sandboxes and
//! containers as isolated host processes, drives an external CNI plugin for
//! their networking, hands workloads to the external `socker` executor, and
//! keeps all persistent truth in etcd so that a multi-node cluster stays
//! consistent across restarts.
//!
//! Layering, leaves first: [`store`] (KV gateway) and [`os`] (host effects)
//! at the bottom; [`ipam`], [`naming`], [`network`] and [`filter`] above
//! them; the [`sandbox`] and [`container`] engines on top, stitched together
//! by [`service`] and exposed through [`server`].

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod filter;
pub mod image;
pub mod ipam;
pub mod naming;
pub mod network;
pub mod os;
pub mod runtime;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
