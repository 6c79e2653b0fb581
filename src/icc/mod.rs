// src/icc/mod.rs
// Host networking for instances: managed bridges and the DNS services around them

pub mod dns;
pub mod network;
