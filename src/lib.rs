pub mod config;
pub mod contacts;
pub mod events;
pub mod logging;
pub mod messages;
pub mod messenger;
pub mod model;
pub mod network;
pub mod storage;
pub mod transfers;
