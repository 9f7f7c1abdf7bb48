//! Queue-driven synchronization of a conference catalog to an external record
//! repository.

pub mod config;
pub mod db;
pub mod marcxml;
pub mod model;
pub mod repository;
pub mod simplify;
pub mod sync;
pub mod uploader;
