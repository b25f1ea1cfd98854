pub mod mvee_logger;
