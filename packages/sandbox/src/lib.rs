// ABOUTME: Sandbox provisioning for drydock
// ABOUTME: Provider abstraction, Docker backend, repo setup, and handle storage

pub mod providers;
pub mod provision;
pub mod storage;

pub use providers::{
    ContainerInfo, ContainerStatus, DockerProvider, ExecResult, ExecStream, OutputChunk, Provider,
    ProviderError, SandboxSpec, StreamType,
};
pub use provision::{ProvisionError, ProvisionRequest, Provisioner};
pub use storage::{SandboxHandle, SandboxStatus, SandboxStorage, StorageError};
