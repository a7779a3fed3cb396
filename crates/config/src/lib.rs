pub mod config;
pub mod fs;

pub use config::{
    AppConfig, ConfigDescriptor, ConfigOverride, ConfigOverrides, ExplainOverride,
    InferenceOverride, ModelDefaults, ModelOverride, ResourceLocation, ServerOverride,
    ServerSettings,
};
pub use fs::{LocalFileSystem, Namespace, VirtualFileSystem, VirtualPath};
