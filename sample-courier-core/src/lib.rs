#![doc = "sample-courier-core: content-addressed batch dispatch engine for sample-courier."]

//! This crate holds everything except the HTTP client and the command line:
//! content identity, the storage backends, the paginated enumerator and the
//! batch dispatcher with its workflows.
//!
//! # Usage
//! The CLI crate wires a concrete [`contract::RemoteService`] and a
//! [`storage::Storage`] built by [`storage::connect`] into the workflows in
//! [`workflow`], then runs them through a [`dispatch::Dispatcher`].

pub mod contract;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod keylist;
pub mod paginate;
pub mod storage;
pub mod targets;
pub mod workflow;

pub use error::{Error, Result};
pub use identity::ObjectKey;
