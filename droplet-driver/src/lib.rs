use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use droplet_common::metadata::decode_prior;
use droplet_common::target_options::{default_targets, target_manifest};
use droplet_common::{
    DriverError, ProjectInfo, ProjectMetadata, ProjectRequest, ProviderInfo, ProviderTarget, Result,
    TargetOptions, TargetProperty, WorkspaceInfo, WorkspaceMetadata, WorkspaceRequest,
};
use droplet_providers::{CloudProvider, ProviderFactory};
use tokio_util::sync::CancellationToken;

pub mod bootstrap;
pub mod cli;
pub mod context;
pub mod logger;
pub mod project;
pub mod reconciliation;
pub mod remote;
pub mod settings;
pub mod state_machine;
pub mod workspace;

pub use context::{DriverContext, InitializeProviderRequest};
pub use remote::{ExecOutput, RemoteExecutor, SshExecutor};
pub use settings::DriverSettings;

use logger::EventLog;

pub const PROVIDER_NAME: &str = "digitalocean";

/// Host-facing driver interface. Every call runs to completion before returning.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn get_info(&self) -> Result<ProviderInfo>;
    async fn get_target_manifest(&self) -> Result<Vec<TargetProperty>>;
    async fn get_default_targets(&self) -> Result<Vec<ProviderTarget>>;
    async fn initialize(&self, req: InitializeProviderRequest) -> Result<()>;

    async fn create_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo>;
    async fn start_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo>;
    async fn stop_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo>;
    async fn destroy_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo>;
    async fn get_workspace_info(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo>;

    async fn create_project(&self, req: &ProjectRequest) -> Result<ProjectInfo>;
    async fn start_project(&self, req: &ProjectRequest) -> Result<ProjectInfo>;
    async fn stop_project(&self, req: &ProjectRequest) -> Result<ProjectInfo>;
    async fn destroy_project(&self, req: &ProjectRequest) -> Result<ProjectInfo>;
    async fn get_project_info(&self, req: &ProjectRequest) -> Result<ProjectInfo>;
}

/// Everything one lifecycle call needs, borrowed from the driver for its duration.
pub(crate) struct Session<'a> {
    pub ctx: &'a DriverContext,
    pub settings: &'a DriverSettings,
    pub provider: &'a dyn CloudProvider,
    pub executor: &'a dyn RemoteExecutor,
    pub events: &'a EventLog,
    pub cancel: &'a CancellationToken,
}

struct Prepared<M> {
    options: TargetOptions,
    prior: Option<M>,
    provider: Arc<dyn CloudProvider>,
    events: EventLog,
}

/// DigitalOcean implementation of [`WorkspaceProvider`].
pub struct DropletDriver {
    settings: DriverSettings,
    factory: Arc<dyn ProviderFactory>,
    executor: Arc<dyn RemoteExecutor>,
    context: OnceLock<DriverContext>,
}

impl DropletDriver {
    #[cfg(feature = "provider-digitalocean")]
    pub fn new(settings: DriverSettings) -> Self {
        let factory = droplet_providers::digitalocean::DigitalOceanFactory::new(settings.api_config());
        let executor = SshExecutor {
            user: settings.ssh_user.clone(),
            private_key_file: settings.ssh_private_key_file.clone(),
            connect_timeout: settings.ssh_connect_timeout,
            command_timeout: settings.ssh_command_timeout,
        };
        Self::with_parts(settings, Arc::new(factory), Arc::new(executor))
    }

    /// Build a driver on a custom provider factory and remote executor.
    pub fn with_parts(
        settings: DriverSettings,
        factory: Arc<dyn ProviderFactory>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            settings,
            factory,
            executor,
            context: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn context(&self) -> Result<&DriverContext> {
        self.context.get().ok_or(DriverError::NotInitialized)
    }

    // Order matters: no remote call happens before every input is validated.
    fn prepare<M: serde::de::DeserializeOwned>(
        &self,
        ctx: &DriverContext,
        target_options: &str,
        provider_metadata: Option<&str>,
    ) -> Result<Prepared<M>> {
        let options = TargetOptions::parse(target_options)?;
        let prior = decode_prior::<M>(provider_metadata)?;
        let provider = self.factory.connect(&options)?;
        Ok(Prepared {
            options,
            prior,
            provider,
            events: EventLog::new(&ctx.logs_dir),
        })
    }

    fn prepare_workspace(&self, req: &WorkspaceRequest) -> Result<(&DriverContext, Prepared<WorkspaceMetadata>)> {
        let ctx = self.context()?;
        workspace::validate_workspace_id(&req.workspace.id)?;
        let prepared = self.prepare(ctx, &req.target_options, req.provider_metadata.as_deref())?;
        Ok((ctx, prepared))
    }

    fn prepare_project(
        &self,
        req: &ProjectRequest,
    ) -> Result<(&DriverContext, Prepared<ProjectMetadata>, Option<WorkspaceMetadata>)> {
        let ctx = self.context()?;
        req.project.validate()?;
        workspace::validate_workspace_id(&req.project.workspace_id)?;
        let workspace_meta = decode_prior::<WorkspaceMetadata>(req.workspace_metadata.as_deref())?;
        let prepared = self.prepare(ctx, &req.target_options, req.provider_metadata.as_deref())?;
        Ok((ctx, prepared, workspace_meta))
    }

    fn session<'a, M>(
        &'a self,
        ctx: &'a DriverContext,
        prepared: &'a Prepared<M>,
        cancel: &'a CancellationToken,
    ) -> Session<'a> {
        Session {
            ctx,
            settings: &self.settings,
            provider: prepared.provider.as_ref(),
            executor: self.executor.as_ref(),
            events: &prepared.events,
            cancel,
        }
    }

    /// Like `create_workspace`, but the wait for the droplet stops when `cancel`
    /// fires. The droplet is left in place.
    pub async fn create_workspace_with_cancel(
        &self,
        req: &WorkspaceRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceInfo> {
        let (ctx, mut prepared) = self.prepare_workspace(req)?;
        let prior = prepared.prior.take();
        let s = self.session(ctx, &prepared, cancel);
        workspace::create(&s, &req.workspace, &prepared.options, prior).await
    }

    pub async fn start_workspace_with_cancel(
        &self,
        req: &WorkspaceRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceInfo> {
        let (ctx, mut prepared) = self.prepare_workspace(req)?;
        let prior = prepared.prior.take();
        let s = self.session(ctx, &prepared, cancel);
        workspace::start(&s, &req.workspace, prior).await
    }

    pub async fn stop_workspace_with_cancel(
        &self,
        req: &WorkspaceRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceInfo> {
        let (ctx, mut prepared) = self.prepare_workspace(req)?;
        let prior = prepared.prior.take();
        let s = self.session(ctx, &prepared, cancel);
        workspace::stop(&s, &req.workspace, prior).await
    }

    pub async fn destroy_workspace_with_cancel(
        &self,
        req: &WorkspaceRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceInfo> {
        let (ctx, mut prepared) = self.prepare_workspace(req)?;
        let prior = prepared.prior.take();
        let s = self.session(ctx, &prepared, cancel);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DriverError::Cancelled {
                operation: "destroy_workspace".into(),
                remote_id: None,
            }),
            res = workspace::destroy(&s, &req.workspace, &prepared.options, prior) => res,
        }
    }
}

#[async_trait]
impl WorkspaceProvider for DropletDriver {
    async fn get_info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: PROVIDER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn get_target_manifest(&self) -> Result<Vec<TargetProperty>> {
        Ok(target_manifest())
    }

    async fn get_default_targets(&self) -> Result<Vec<ProviderTarget>> {
        Ok(default_targets())
    }

    async fn initialize(&self, req: InitializeProviderRequest) -> Result<()> {
        if self.context.get().is_some() {
            return Err(DriverError::AlreadyInitialized);
        }
        let ctx = DriverContext::from_request(req)?;
        tracing::info!(
            "[driver] initialized: base_path={}, agent_version={}, logs_dir={}",
            ctx.base_path,
            ctx.agent_version,
            ctx.logs_dir.display()
        );
        self.context
            .set(ctx)
            .map_err(|_| DriverError::AlreadyInitialized)
    }

    async fn create_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo> {
        self.create_workspace_with_cancel(req, &CancellationToken::new()).await
    }

    async fn start_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo> {
        self.start_workspace_with_cancel(req, &CancellationToken::new()).await
    }

    async fn stop_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo> {
        self.stop_workspace_with_cancel(req, &CancellationToken::new()).await
    }

    async fn destroy_workspace(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo> {
        self.destroy_workspace_with_cancel(req, &CancellationToken::new()).await
    }

    async fn get_workspace_info(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo> {
        let (ctx, mut prepared) = self.prepare_workspace(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        workspace::get_info(&s, &req.workspace, prior).await
    }

    async fn create_project(&self, req: &ProjectRequest) -> Result<ProjectInfo> {
        let (ctx, mut prepared, workspace_meta) = self.prepare_project(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        project::create(&s, &req.project, workspace_meta.as_ref(), prior).await
    }

    async fn start_project(&self, req: &ProjectRequest) -> Result<ProjectInfo> {
        let (ctx, mut prepared, workspace_meta) = self.prepare_project(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        project::start(&s, &req.project, workspace_meta.as_ref(), prior).await
    }

    async fn stop_project(&self, req: &ProjectRequest) -> Result<ProjectInfo> {
        let (ctx, mut prepared, workspace_meta) = self.prepare_project(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        project::stop(&s, &req.project, workspace_meta.as_ref(), prior).await
    }

    async fn destroy_project(&self, req: &ProjectRequest) -> Result<ProjectInfo> {
        let (ctx, mut prepared, workspace_meta) = self.prepare_project(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        project::destroy(&s, &req.project, workspace_meta.as_ref(), prior).await
    }

    async fn get_project_info(&self, req: &ProjectRequest) -> Result<ProjectInfo> {
        let (ctx, mut prepared, workspace_meta) = self.prepare_project(req)?;
        let prior = prepared.prior.take();
        let cancel = CancellationToken::new();
        let s = self.session(ctx, &prepared, &cancel);
        project::get_info(&s, &req.project, workspace_meta.as_ref(), prior).await
    }
}
