pub mod http;
pub mod ids;
