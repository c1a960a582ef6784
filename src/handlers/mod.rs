pub mod config;
pub mod interface;

pub use self::config::get_config;
pub use self::interface::get_interface;
