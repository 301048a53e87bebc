mod admin;
mod device;
mod health;
mod stream;

pub use admin::{
    analytics_snapshot, create_key, read_config, recent_logs, revoke_device, revoke_key,
};
pub use device::register_device;
pub use health::health;
pub use stream::analytics_stream;
