//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / input_schema / invoke），由 RegistryBuilder 按名注册，
//! build 后得到只读的 CapabilityRegistry：进程内构造一次，以 Arc 在并发运行之间共享，无需加锁。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tools::invocation::InvocationRequest;
use crate::tools::schema::{describe_violations, validate_args};

/// 单次调用的执行上下文：调用 id 与可观察的取消令牌（步超时或用户取消时触发）
#[derive(Clone, Debug)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(invocation_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            cancel,
        }
    }
}

/// 能力 trait：名称、描述（供 LLM 理解）、输入 schema、异步调用（args 为 JSON 对象）
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名称（用于调用请求中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 能力描述
    fn description(&self) -> &str;

    /// 输入 JSON Schema，调用前由 jsonschema 校验
    /// 默认接受任意对象
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行调用；Err 为能力自身的运行时错误（可恢复）
    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> Result<Value, String>;

    /// 运行结束后释放资源（无论成功、截断还是失败都会调用）；默认无操作
    async fn cleanup(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 能力描述符：提供给 Reasoning Port 的 {name, description, input_schema}
#[derive(Clone, Debug, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 解析调用请求失败的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown capability: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),
}

/// 注册构建器：register 按注册顺序收集能力，重名时保留先注册者并告警
#[derive(Default)]
pub struct RegistryBuilder {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, capability: impl Capability + 'static) -> Self {
        self.insert(Arc::new(capability));
        self
    }

    pub fn register_arc(mut self, capability: Arc<dyn Capability>) -> Self {
        self.insert(capability);
        self
    }

    fn insert(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            tracing::warn!(capability = %name, "capability already registered, skipping");
            return;
        }
        self.order.push(name.clone());
        self.capabilities.insert(name, capability);
    }

    pub fn build(self) -> CapabilityRegistry {
        let descriptors = self
            .order
            .iter()
            .filter_map(|name| self.capabilities.get(name))
            .map(|c| CapabilityDescriptor {
                name: c.name().to_string(),
                description: c.description().to_string(),
                input_schema: c.input_schema(),
            })
            .collect();
        CapabilityRegistry {
            capabilities: self.capabilities,
            order: self.order,
            descriptors,
        }
    }
}

/// 只读能力注册表：get / resolve / descriptors
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
    /// 注册顺序的描述符快照（schema 在构建时求值一次）
    descriptors: Vec<CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    pub fn descriptors(&self) -> &[CapabilityDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// 按名解析并校验参数：不存在返回 NotFound，参数不符合 schema 返回 Validation
    pub fn resolve(
        &self,
        request: &InvocationRequest,
    ) -> Result<(Arc<dyn Capability>, Value), RegistryError> {
        let capability = self
            .get(&request.name)
            .ok_or_else(|| RegistryError::NotFound(request.name.clone()))?;
        let schema = self
            .descriptors
            .iter()
            .find(|d| d.name == request.name)
            .map(|d| d.input_schema.clone())
            .unwrap_or_else(|| capability.input_schema());
        let args = request.arguments_value();
        validate_args(&schema, &args)
            .map_err(|violations| RegistryError::Validation(describe_violations(&violations)))?;
        Ok((capability, args))
    }

    /// 按注册顺序调用每个能力的 cleanup；失败只记录，不中断其余能力
    pub async fn cleanup_all(&self) {
        for name in &self.order {
            let Some(capability) = self.capabilities.get(name) else {
                continue;
            };
            if let Err(e) = capability.cleanup().await {
                tracing::warn!(capability = %name, error = %e, "capability cleanup failed");
            }
        }
    }

    /// 渲染为 JSON 文本，用于生成 prompt 中的 Available capabilities 段落
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.descriptors).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoCapability, TerminateCapability};
    use serde_json::json;

    #[test]
    fn test_register_and_descriptors_keep_order() {
        let registry = CapabilityRegistry::builder()
            .register(TerminateCapability)
            .register(EchoCapability)
            .build();
        assert_eq!(registry.names(), vec!["terminate", "echo"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_is_skipped() {
        let registry = CapabilityRegistry::builder()
            .register(EchoCapability)
            .register(EchoCapability)
            .build();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_not_found_and_invalid() {
        let registry = CapabilityRegistry::builder().register(EchoCapability).build();

        let missing = InvocationRequest::from_value("1", "foo", json!({}));
        assert!(matches!(registry.resolve(&missing), Err(RegistryError::NotFound(n)) if n == "foo"));

        let bad = InvocationRequest::from_value("2", "echo", json!({"text": 7}));
        match registry.resolve(&bad) {
            Err(RegistryError::Validation(msg)) => assert!(msg.contains("text")),
            _ => panic!("Expected Validation"),
        }

        let good = InvocationRequest::from_value("3", "echo", json!({"text": "hi"}));
        let (cap, args) = registry.resolve(&good).unwrap();
        assert_eq!(cap.name(), "echo");
        assert_eq!(args, json!({"text": "hi"}));
    }

    #[test]
    fn test_schema_json_lists_capabilities() {
        let registry = CapabilityRegistry::builder().register(EchoCapability).build();
        let s = registry.to_schema_json();
        assert!(s.contains("\"echo\""));
        assert!(s.contains("input_schema"));
    }
}
