pub mod blacklist;
pub mod config;
pub mod domain;
pub mod error;
pub mod mapping;
pub mod openbis;
pub mod output;
pub mod seek;
pub mod structure;
pub mod sync;
pub mod translator;
