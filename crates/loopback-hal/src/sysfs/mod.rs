//! Readers for loop device state exposed under `/sys/block`.

pub mod block;
