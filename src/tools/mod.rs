//! 能力层：调用请求/结果、只读注册表、输入 schema 校验、分发器，以及内置 echo / terminate

pub mod echo;
pub mod executor;
pub mod invocation;
pub mod registry;
pub mod schema;
pub mod terminate;

pub use echo::EchoCapability;
pub use executor::{DispatchError, InvocationTracker, ToolDispatcher};
pub use invocation::{InvocationRequest, InvocationResult, InvocationStatus};
pub use registry::{
    Capability, CapabilityDescriptor, CapabilityRegistry, InvocationContext, RegistryBuilder,
    RegistryError,
};
pub use schema::{invocation_format_schema_json, validate_args, SchemaViolation};
pub use terminate::{TerminateCapability, TERMINATE};
