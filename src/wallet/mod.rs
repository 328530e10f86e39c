pub mod catalog;
pub mod poller;
pub mod reconcile;
pub mod service;
