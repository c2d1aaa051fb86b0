pub mod client;

pub use client::StreamClient;
