pub mod backends;
pub mod config;
pub mod meetings;
pub mod notify;
pub mod queues;
pub mod realtime;
pub mod shared;
pub mod users;
