#![forbid(unsafe_code)]

pub mod assemble;
pub mod bookpart;
pub mod build;
pub mod cli;
pub mod collection;
pub mod config;
pub mod container;
pub mod dom;
pub mod embed;
pub mod error;
pub mod exercises;
pub mod formats;
pub mod h5p;
pub mod html;
pub mod ids;
pub mod license;
pub mod logging;
pub mod metadata;
pub mod namespaces;
pub mod pool;
pub mod references;
pub mod resources;
pub mod slug;
pub mod tags;
pub mod toc;
pub mod transform;
