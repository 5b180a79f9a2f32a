//! # Storage Module
//!
//! The sled-backed implementation of the [`crate::rpc::Store`] contract.
//! Hosts that already have a durable store wire their own implementation
//! instead; this one exists so a node (and the tests) can run without one.

pub mod db;

pub use db::SledStore;
