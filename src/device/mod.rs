mod client;

pub use client::{classify_client, ClientInfo, ClientKind};
