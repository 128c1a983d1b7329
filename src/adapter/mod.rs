pub mod client;
pub mod error;
pub mod simulated;
pub mod types;

use async_trait::async_trait;

pub use client::HttpToolAdapter;
pub use error::AdapterError;
pub use simulated::SimulatedAdapter;
pub use types::{ToolOutput, ToolRequest};

/// Protocol boundary to one external tool.
///
/// Implementations shape the request for their service and should honor
/// the tool's declared timeout; the invoker enforces it regardless.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn call(&self, request: &ToolRequest) -> Result<ToolOutput, AdapterError>;
}
