pub mod schema;

pub use schema::{
    AgentConfig, Config, DependencyConfig, EnvironmentConfig, ExecutablesConfig, ExtrasConfig,
    OutputConfig, PathsConfig, SchedulerConfig, ScmConfig, SecretsConfig, WorkspaceConfig,
};
