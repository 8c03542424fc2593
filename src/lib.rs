pub mod agent;
pub mod cua;
pub mod executor;
pub mod surface;

pub use agent::{Agent, AgentError, AgentState};
pub use cua::{CuaClient, CuaConfig, Endpoint, Provider, StepResponse};
pub use executor::{Action, Executor};
pub use surface::{OsFamily, RemoteSurface, Surface, SurfaceConfig, SurfaceError, SurfaceInfo};
