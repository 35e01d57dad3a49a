pub mod defaults;
mod load;
mod settings;

pub use load::{DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, load_settings, resolve_config_source};
pub use settings::ForqSettings;
