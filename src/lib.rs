//! LAN clipboard synchronization: a hub other machines connect to, peers
//! that dial it, and a clipboard monitor that detects genuine local changes
//! without echoing back the writes it made itself.

pub mod clipboard;
pub mod config;
pub mod hub;
pub mod peer;
pub mod protocol;
