#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-runtime** – Runtime composition for the SOS platform.
//!
//! One initialization phase builds one instance of every subsystem and
//! bundles them into [`Services`]; the engine, daemon, and workers each own
//! a view of the bundle and nothing owns another component. No module-level
//! mutable state exists anywhere in the workspace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tracing::{info, warn};

pub mod artifacts;
pub mod config;
pub mod secrets;

pub use artifacts::{ArtifactFile, ArtifactManifest, ArtifactStore};
pub use config::SosConfig;
pub use secrets::SecretsVault;

use sos_bus::{MemoryBus, QueueBus, RedisBus};
use sos_capability::{TokenIssuer, TokenVerifier};
use sos_gateway::{GatewayConfig, ModelRegistry};
use sos_memory::{MemoryStore, MirrorClient};
use sos_registry::WorkerRegistry;
use sos_resilience::{BucketConfig, RateLimiter};
use sos_task_store::TaskStore;
use sos_types::Subject;

/// Live flags the engine surfaces and the daemon drives.
///
/// The subconscious stream reports these; they are the only mutable state
/// the two processes share outside the stores and the bus.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    dreaming: AtomicBool,
}

impl RuntimeFlags {
    /// Whether a dream synthesis pass is currently running.
    pub fn is_dreaming(&self) -> bool {
        self.dreaming.load(Ordering::Relaxed)
    }

    /// Set by the dream loop around a synthesis pass.
    pub fn set_dreaming(&self, dreaming: bool) {
        self.dreaming.store(dreaming, Ordering::Relaxed);
    }
}

/// The services bundle injected into the engine, daemon, and workers.
///
/// Holding a `Services` grants a *view*; the bundle itself owns the
/// subsystem instances for the life of the process.
pub struct Services {
    /// Immutable runtime configuration.
    pub config: SosConfig,
    /// The task lifecycle store.
    pub store: Arc<TaskStore>,
    /// The worker reputation registry.
    pub registry: Arc<WorkerRegistry>,
    /// The queue bus (in-memory or Redis, per configuration).
    pub bus: Arc<dyn QueueBus>,
    /// The model adapter registry.
    pub models: Arc<ModelRegistry>,
    /// The Mirror memory client, when a deployment is configured.
    pub memory: Option<Arc<dyn MemoryStore>>,
    /// The root gatekeeper's token issuer.
    pub issuer: Arc<TokenIssuer>,
    /// The capability verifier every gated surface shares.
    pub verifier: Arc<TokenVerifier>,
    /// The per-(subject, action) request limiter.
    pub limiter: Arc<RateLimiter>,
    /// The content-addressed artifact store.
    pub artifacts: Arc<ArtifactStore>,
    /// The secrets vault, when `SOS_SECRET_KEY` is set.
    pub secrets: Option<Arc<SecretsVault>>,
    /// Live flags shared between the engine surface and the daemon loops.
    pub flags: Arc<RuntimeFlags>,
}

impl Services {
    /// Build every subsystem from `config`.
    ///
    /// This is the single composition point of the process; everything the
    /// daemon and engine touch is constructed (and wired) here, once.
    pub async fn initialize(config: SosConfig) -> Result<Arc<Self>> {
        let store = Arc::new(
            TaskStore::open(config.tasks_dir())
                .await
                .context("open task store")?,
        );
        let registry = Arc::new(
            WorkerRegistry::open(config.worker_registry_path())
                .await
                .context("open worker registry")?,
        );

        let bus: Arc<dyn QueueBus> = match &config.redis_url {
            Some(url) => {
                let bus = RedisBus::connect(url).await.context("connect queue substrate")?;
                info!(url, "using redis queue bus");
                Arc::new(bus)
            }
            None => {
                info!("no SOS_REDIS_URL set, using in-memory queue bus");
                Arc::new(MemoryBus::default())
            }
        };

        let gateway_config = GatewayConfig::from_env().context("gateway configuration")?;
        let models = Arc::new(ModelRegistry::from_config(&gateway_config)?);

        let memory: Option<Arc<dyn MemoryStore>> = match &config.memory_url {
            Some(url) => Some(Arc::new(
                MirrorClient::new(url).context("memory client")?,
            )),
            None => {
                warn!("no SOS_MEMORY_URL set; exchanges and dreams will not persist");
                None
            }
        };

        let issuer_subject = Subject::service("gatekeeper");
        let issuer = match &config.issuer_seed {
            Some(seed) => {
                let raw = hex::decode(seed.expose_secret().trim())
                    .context("SOS_ISSUER_KEY is not hex")?;
                let raw: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("SOS_ISSUER_KEY must decode to 32 bytes"))?;
                TokenIssuer::from_secret_key(issuer_subject, &raw)
            }
            None => {
                warn!("no SOS_ISSUER_KEY set; generating an ephemeral issuer keypair");
                TokenIssuer::generate(issuer_subject)
            }
        };
        let verifier = Arc::new(TokenVerifier::new(issuer.verifying_key()));

        let artifacts = Arc::new(
            ArtifactStore::open(config.artifacts_dir())
                .await
                .context("open artifact store")?,
        );
        let secrets = match &config.secret_key {
            Some(key) => Some(Arc::new(
                SecretsVault::open(config.secrets_dir(), key)
                    .await
                    .context("open secrets vault")?,
            )),
            None => None,
        };

        info!(
            home = %config.home.display(),
            agent = %config.agent_id,
            strict = config.strict_capabilities,
            "services initialized"
        );
        Ok(Arc::new(Self {
            config,
            store,
            registry,
            bus,
            models,
            memory,
            issuer: Arc::new(issuer),
            verifier,
            limiter: Arc::new(RateLimiter::new(BucketConfig::default())),
            artifacts,
            secrets,
            flags: Arc::new(RuntimeFlags::default()),
        }))
    }
}
