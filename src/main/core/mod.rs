pub mod configuration;
pub mod detach;
pub mod logger;
pub mod main;
pub mod monitor;
pub mod monitor_thread;
pub mod pid_mapping;
pub mod registry;
pub mod shutdown;
