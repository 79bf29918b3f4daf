// Library side of the deterrent: the launcher/web layer drives `supervisor`,
// the binary in main.rs is a standalone launcher over the same surface.

pub mod classifier;
pub mod config;
pub mod cooldown;
pub mod detection_loop;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod services;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod utils;
