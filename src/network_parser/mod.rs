//! 网络书源模块入口。

pub mod network;

pub use network::{HttpSourceClient, HttpSourceConfig};
