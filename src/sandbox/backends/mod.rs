mod container;
mod docker;
mod proxy;
mod runtime;

pub use container::{effective_timeout, ContainerBackend, TEARDOWN_GRACE};
pub use docker::{create_args, DockerCli};
pub use proxy::ProxyBackend;
pub use runtime::{
    read_capped, BindMount, CappedOutput, ContainerLogs, ContainerRuntime, ContainerSpec,
};
