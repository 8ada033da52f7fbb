pub mod health;
pub mod sensor_events;
pub mod stream;
