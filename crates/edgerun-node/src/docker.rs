//! Docker-backed sandbox driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use edgerun_common::{ContainerId, EdgeError, Function, Result, SandboxDriver, SandboxOutput};

const NANO_CPUS_PER_SHARE: f64 = 1_000_000_000.0;

pub struct DockerDriver {
    docker: Arc<Docker>,
}

impl DockerDriver {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EdgeError::SandboxDriver(format!("cannot connect to docker: {e}")))?;
        Ok(Self::new(Arc::new(docker)))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| EdgeError::SandboxDriver(format!("image pull failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxDriver for DockerDriver {
    async fn create(&self, fun: &Function) -> Result<ContainerId> {
        let image = fun.image()?;
        self.pull_image(&image).await?;

        let name = format!("edgerun-{}-{}", fun.name, Uuid::new_v4());
        let mut env = vec![format!("EDGERUN_FUNCTION={}", fun.name)];
        if let Some(code) = &fun.tar_function_code {
            env.push(format!("EDGERUN_CODE_TAR={code}"));
        }

        let config = ContainerConfig {
            image: Some(image),
            env: Some(env),
            // keep the sandbox alive between invocations
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while true; do sleep 30; done".to_string(),
            ]),
            host_config: Some(HostConfig {
                memory: Some(fun.memory_mb * 1024 * 1024),
                nano_cpus: Some((fun.cpu_demand * NANO_CPUS_PER_SHARE) as i64),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| EdgeError::SandboxDriver(format!("container creation failed: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| EdgeError::SandboxDriver(format!("container start failed: {e}")))?;

        info!(container = %created.id, function = %fun.name, "started sandbox");
        Ok(created.id)
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EdgeError::SandboxDriver(format!("container removal failed: {e}")))?;
        debug!(container = %id, "removed sandbox");
        Ok(())
    }

    async fn invoke(
        &self,
        id: &ContainerId,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<SandboxOutput> {
        let payload = serde_json::to_string(params)
            .map_err(|e| EdgeError::Internal(format!("cannot encode params: {e}")))?;

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        format!("echo '{}' | /function/handler", payload.replace('\'', "'\\''")),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EdgeError::SandboxDriver(format!("exec creation failed: {e}")))?;

        let started = Instant::now();
        let mut stdout = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EdgeError::SandboxDriver(format!("exec start failed: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk
                        .map_err(|e| EdgeError::SandboxDriver(format!("exec stream failed: {e}")))?;
                    stdout.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }
        let duration = started.elapsed().as_secs_f64();

        let output = serde_json::from_str(&stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.trim_end().to_string()));
        Ok(SandboxOutput { output, duration })
    }
}
