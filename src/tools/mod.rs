//! 工具层：注册表、批量执行调度、内置工具

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod time;

pub use echo::EchoTool;
pub use executor::{BatchOutcome, ToolCallLog, ToolExecutor};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schema::parameters_schema;
pub use time::GetTimeTool;
