pub mod chat_pcm;
pub mod config;

pub use chat_pcm::chat_pcm;
pub use config::get_config;
