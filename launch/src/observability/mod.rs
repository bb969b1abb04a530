pub mod logging;

pub use logging::{default_log_dir, init_logging, launch_filter};
