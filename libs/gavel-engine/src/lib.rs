pub mod classify;
pub mod judge;
pub mod languages;
pub mod policy;
pub mod sandbox;
pub mod workspace;


pub use judge::{JudgeEngine, JudgeOptions};
pub use languages::{LanguageProfile, LanguageRegistry};
pub use policy::{InputPolicy, Rejection};
pub use sandbox::{DockerSandbox, Sandbox, SandboxSettings};
pub use workspace::WorkspaceManager;
