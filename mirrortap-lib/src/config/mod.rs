mod loader;
mod types;

pub use loader::load_from_path;
pub use types::{
    Action, CaptureMode, CidrV4, Config, FilterConfig, MatchConfig, RuleConfig, RuntimeConfig,
    TruncateConfig, TunnelConfig, TunnelType,
};
